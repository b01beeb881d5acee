//! Stored-procedure invocation on the target database.

use async_trait::async_trait;
use serde::de::IgnoredAny;
use sqlx::{Connection, PgConnection};
use tracing::{debug, warn};

use rowbus_core::config::PostgresConfig;

use crate::connect::connect;
use crate::error::StoreError;

/// The single callable the consumer feeds messages into.
#[async_trait]
pub trait ProcedureTarget: Send {
    /// Call the procedure with `body` as its only argument, in one transaction.
    ///
    /// [`StoreError::Connection`] means the connection is lost; every other
    /// error concerns this message only and the transaction was rolled back.
    async fn invoke(&mut self, body: &[u8]) -> Result<(), StoreError>;

    async fn close(&mut self);
}

/// Opens a fresh [`ProcedureTarget`] for each consumer session.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ProcedureTarget>, StoreError>;
}

pub(crate) fn json_argument(body: &[u8]) -> Result<&str, StoreError> {
    let text = std::str::from_utf8(body).map_err(|e| StoreError::InvalidBody(e.to_string()))?;
    serde_json::from_str::<IgnoredAny>(text)
        .map_err(|e| StoreError::InvalidBody(e.to_string()))?;
    Ok(text)
}

/// Run `CALL <procedure>($1::jsonb)` with `body` inside a transaction on `conn`.
///
/// `procedure` must already be validated as an SQL identifier. Commits on
/// success; rolls back before returning any statement failure.
pub async fn invoke(
    conn: &mut PgConnection,
    procedure: &str,
    body: &[u8],
) -> Result<(), StoreError> {
    let argument = json_argument(body)?;
    let statement = format!("CALL {procedure}($1::jsonb)");

    let mut tx = conn.begin().await?;
    let called = sqlx::query(&statement)
        .bind(argument)
        .execute(&mut *tx)
        .await;

    match called {
        Ok(_) => {
            tx.commit().await?;
            debug!(procedure, "procedure committed");
            Ok(())
        }
        Err(e) => {
            let cause = StoreError::from(e);
            if let Err(rollback) = tx.rollback().await {
                warn!(procedure, error = %rollback, "rollback failed");
                let rollback = StoreError::from(rollback);
                if rollback.is_connection() {
                    return Err(rollback);
                }
            }
            Err(cause)
        }
    }
}

/// A procedure on a dedicated PostgreSQL connection owned by one consumer session.
pub struct PgProcedure {
    conn: Option<PgConnection>,
    procedure: String,
}

impl PgProcedure {
    pub async fn connect(config: &PostgresConfig, procedure: &str) -> Result<Self, StoreError> {
        let conn = connect(config).await?;
        Ok(Self {
            conn: Some(conn),
            procedure: procedure.to_string(),
        })
    }
}

#[async_trait]
impl ProcedureTarget for PgProcedure {
    async fn invoke(&mut self, body: &[u8]) -> Result<(), StoreError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| StoreError::Connection("target connection closed".to_string()))?;
        invoke(conn, &self.procedure, body).await
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "target connection close failed");
            }
        }
    }
}

/// Connects [`PgProcedure`]s to the configured target database.
pub struct PgTargetConnector {
    config: PostgresConfig,
    procedure: String,
}

impl PgTargetConnector {
    pub fn new(config: &PostgresConfig, procedure: &str) -> Self {
        Self {
            config: config.clone(),
            procedure: procedure.to_string(),
        }
    }
}

#[async_trait]
impl TargetConnector for PgTargetConnector {
    async fn connect(&self) -> Result<Box<dyn ProcedureTarget>, StoreError> {
        let target = PgProcedure::connect(&self.config, &self.procedure).await?;
        Ok(Box::new(target))
    }
}
