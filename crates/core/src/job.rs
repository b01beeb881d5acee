use serde::{Deserialize, Serialize};

/// A named extraction job as stored in the configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub source_query: String,
    pub queue_name: String,
}
