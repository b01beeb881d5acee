pub mod config;
pub mod error;
pub mod job;
pub mod row;

pub use config::Config;
pub use error::*;
pub use job::Job;
pub use row::{encode, Message, Row, SourceValue};
