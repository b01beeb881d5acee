//! Source query execution.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use rowbus_core::config::PostgresConfig;
use rowbus_core::Row;

use crate::connect::connect_options;
use crate::decode::{column_names, decode_row};
use crate::error::StoreError;

/// Executes a source query and yields its rows in result order.
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    fn fetch<'a>(&'a self, query: &'a str) -> BoxStream<'a, Result<Row, StoreError>>;

    async fn close(&self);
}

/// Source database on PostgreSQL. Holds at most one connection, opened on
/// first use.
pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    pub fn new(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(connect_options(config)?);
        info!(source = %config.redacted(), "source database configured");
        Ok(Self { pool })
    }
}

#[async_trait]
impl SourceDatabase for PgSource {
    fn fetch<'a>(&'a self, query: &'a str) -> BoxStream<'a, Result<Row, StoreError>> {
        debug!(query, "executing source query");
        let mut columns: Option<Arc<[String]>> = None;
        sqlx::query(query)
            .fetch(&self.pool)
            .map(move |result| {
                let row = result?;
                let names = columns.get_or_insert_with(|| column_names(&row)).clone();
                decode_row(&row, names)
            })
            .boxed()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
