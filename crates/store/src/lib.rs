pub mod connect;
pub mod decode;
pub mod error;
pub mod jobs;
pub mod memory;
pub mod procedure;
pub mod source;

pub use error::StoreError;
pub use jobs::{JobResolver, PgJobStore};
pub use memory::{MemoryJobStore, MemoryProcedure, MemorySource};
pub use procedure::{invoke, PgProcedure, PgTargetConnector, ProcedureTarget, TargetConnector};
pub use source::{PgSource, SourceDatabase};
