//! Queue-mediated row delivery: the producer path (job → rows → queue) and
//! the consumer path (queue → stored procedure) with its reconnect loop.

pub mod dispatcher;
pub mod producer;
pub mod publisher;
pub mod session;
pub mod supervisor;

pub use dispatcher::{DispatchStats, Dispatcher, Outcome, SessionState, SessionStatus};
pub use producer::{JobReport, Producer};
pub use publisher::publish_all;
pub use session::{Session, SessionConnector, PREFETCH};
pub use supervisor::ReconnectSupervisor;
