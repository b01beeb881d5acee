//! One-shot producer run: resolve a job, stream its rows onto its queue.

use tracing::{error, info};

use rowbus_core::RelayError;
use rowbus_queue::Broker;
use rowbus_store::{JobResolver, SourceDatabase, StoreError};

use crate::publisher::publish_all;

/// Outcome of a successful job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job: String,
    pub queue: String,
    pub published: u64,
}

/// The producer path. Strictly sequential; runs one job and returns.
pub struct Producer<'a> {
    jobs: &'a dyn JobResolver,
    source: &'a dyn SourceDatabase,
    broker: &'a dyn Broker,
}

impl<'a> Producer<'a> {
    pub fn new(
        jobs: &'a dyn JobResolver,
        source: &'a dyn SourceDatabase,
        broker: &'a dyn Broker,
    ) -> Self {
        Self {
            jobs,
            source,
            broker,
        }
    }

    /// Run `job_name` to completion. The source connection is closed on every
    /// path; no step is retried.
    pub async fn run(&self, job_name: &str) -> Result<JobReport, RelayError> {
        let job = self.jobs.resolve(job_name).await.map_err(|e| match e {
            StoreError::JobNotFound(name) => RelayError::JobNotFound(name),
            other => RelayError::JobStore(other.to_string()),
        })?;
        info!(job = %job.name, queue = %job.queue_name, "job resolved");

        let rows = self.source.fetch(&job.source_query);
        let result = publish_all(self.broker, &job.queue_name, rows).await;
        self.source.close().await;

        match result {
            Ok(published) => {
                info!(
                    job = %job.name,
                    queue = %job.queue_name,
                    published,
                    "job completed"
                );
                Ok(JobReport {
                    job: job.name,
                    queue: job.queue_name,
                    published,
                })
            }
            Err(e) => {
                error!(job = %job.name, queue = %job.queue_name, error = %e, "job failed");
                Err(e)
            }
        }
    }
}
