//! Job lookup against the configuration store.

use async_trait::async_trait;
use sqlx::Connection;
use tracing::{debug, warn};

use rowbus_core::config::PostgresConfig;
use rowbus_core::Job;

use crate::connect::connect;
use crate::error::StoreError;

/// Resolves a job name to its source query and target queue.
///
/// One read, no retry: a missing job is an operator-fixable misconfiguration.
#[async_trait]
pub trait JobResolver: Send + Sync {
    async fn resolve(&self, job_name: &str) -> Result<Job, StoreError>;
}

/// Jobs table in PostgreSQL with columns `job_name`, `source_query`,
/// `rabbitmq_queue`.
pub struct PgJobStore {
    config: PostgresConfig,
    select: String,
}

impl PgJobStore {
    /// `table` must already be validated as an SQL identifier.
    pub fn new(config: &PostgresConfig, table: &str) -> Self {
        Self {
            config: config.clone(),
            select: format!(
                "SELECT source_query, rabbitmq_queue FROM {table} WHERE job_name = $1"
            ),
        }
    }
}

#[async_trait]
impl JobResolver for PgJobStore {
    async fn resolve(&self, job_name: &str) -> Result<Job, StoreError> {
        if job_name.trim().is_empty() {
            return Err(StoreError::JobNotFound(job_name.to_string()));
        }

        let mut conn = connect(&self.config).await?;
        let found = sqlx::query_as::<_, (String, String)>(&self.select)
            .bind(job_name)
            .fetch_optional(&mut conn)
            .await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "closing configuration store connection failed");
        }

        match found? {
            Some((source_query, queue_name)) => {
                debug!(job = job_name, queue = %queue_name, "job resolved");
                Ok(Job {
                    name: job_name.to_string(),
                    source_query,
                    queue_name,
                })
            }
            None => Err(StoreError::JobNotFound(job_name.to_string())),
        }
    }
}
