//! In-memory stand-ins for the configuration store, source database and
//! target procedure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use rowbus_core::{Job, Row};

use crate::error::StoreError;
use crate::jobs::JobResolver;
use crate::procedure::{json_argument, ProcedureTarget, TargetConnector};
use crate::source::SourceDatabase;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Jobs ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: HashMap<String, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, name: &str, source_query: &str, queue_name: &str) -> Self {
        self.jobs.insert(
            name.to_string(),
            Job {
                name: name.to_string(),
                source_query: source_query.to_string(),
                queue_name: queue_name.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl JobResolver for MemoryJobStore {
    async fn resolve(&self, job_name: &str) -> Result<Job, StoreError> {
        self.jobs
            .get(job_name)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound(job_name.to_string()))
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// Fixed result sets keyed by query text.
#[derive(Default)]
pub struct MemorySource {
    results: HashMap<String, Vec<Row>>,
    fail_after: Option<usize>,
    closed: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, query: &str, rows: Vec<Row>) -> Self {
        self.results.insert(query.to_string(), rows);
        self
    }

    /// Yield `n` rows, then fail as if the connection dropped mid-cursor.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceDatabase for MemorySource {
    fn fetch<'a>(&'a self, query: &'a str) -> BoxStream<'a, Result<Row, StoreError>> {
        let Some(rows) = self.results.get(query) else {
            let err = StoreError::Database(format!("relation for query {query:?} does not exist"));
            return stream::once(async move { Err(err) }).boxed();
        };
        let limit = self.fail_after.unwrap_or(usize::MAX);
        let ok = stream::iter(rows.iter().take(limit).cloned().map(Ok));
        if limit < rows.len() {
            let lost = StoreError::Connection("source connection lost".to_string());
            ok.chain(stream::once(async move { Err(lost) })).boxed()
        } else {
            ok.boxed()
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Procedure ───────────────────────────────────────────────────────

#[derive(Default)]
struct ProcedureState {
    committed: Vec<Vec<u8>>,
    calls: usize,
    rejects: Vec<Vec<u8>>,
    disconnects: Vec<Vec<u8>>,
    closed: usize,
}

/// Records committed bodies. Clones share state, so a test can keep a handle
/// while sessions own their copies.
#[derive(Clone, Default)]
pub struct MemoryProcedure {
    state: Arc<Mutex<ProcedureState>>,
}

impl MemoryProcedure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make calls with exactly this body raise (e.g. a constraint violation).
    pub fn reject(&self, body: &[u8]) {
        lock(&self.state).rejects.push(body.to_vec());
    }

    /// Make calls with exactly this body lose the connection.
    pub fn disconnect_on(&self, body: &[u8]) {
        lock(&self.state).disconnects.push(body.to_vec());
    }

    pub fn committed(&self) -> Vec<Vec<u8>> {
        lock(&self.state).committed.clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.state).calls
    }

    pub fn closed(&self) -> usize {
        lock(&self.state).closed
    }
}

#[async_trait]
impl ProcedureTarget for MemoryProcedure {
    async fn invoke(&mut self, body: &[u8]) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state.calls += 1;
        json_argument(body)?;
        if state.disconnects.iter().any(|b| b == body) {
            return Err(StoreError::Connection("server closed the connection unexpectedly".into()));
        }
        if state.rejects.iter().any(|b| b == body) {
            return Err(StoreError::Database(
                "duplicate key value violates unique constraint".into(),
            ));
        }
        state.committed.push(body.to_vec());
        Ok(())
    }

    async fn close(&mut self) {
        lock(&self.state).closed += 1;
    }
}

/// Every session gets a handle onto the same recorded state.
#[async_trait]
impl TargetConnector for MemoryProcedure {
    async fn connect(&self) -> Result<Box<dyn ProcedureTarget>, StoreError> {
        Ok(Box::new(self.clone()))
    }
}
