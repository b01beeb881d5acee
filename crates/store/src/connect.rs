use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{ConnectOptions, PgConnection};

use rowbus_core::config::PostgresConfig;

use crate::error::StoreError;

/// Build driver options from config. Credentials never pass through a URL,
/// so passwords need no escaping.
pub fn connect_options(config: &PostgresConfig) -> Result<PgConnectOptions, StoreError> {
    let ssl_mode = PgSslMode::from_str(&config.ssl_mode)
        .map_err(|e| StoreError::Settings(format!("ssl mode '{}': {e}", config.ssl_mode)))?;

    let mut options = PgConnectOptions::new()
        .port(config.port)
        .ssl_mode(ssl_mode)
        .application_name("rowbus");
    if let Some(host) = &config.host {
        options = options.host(host);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    if let Some(username) = &config.username {
        options = options.username(username);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    Ok(options)
}

pub async fn connect(config: &PostgresConfig) -> Result<PgConnection, StoreError> {
    connect_options(config)?
        .connect()
        .await
        .map_err(|e| StoreError::Connection(format!("{}: {e}", config.redacted())))
}
