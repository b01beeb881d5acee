//! Database error types.

use thiserror::Error;

use rowbus_core::{CodecError, RelayError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job '{0}' not found")]
    JobNotFound(String),

    /// The connection itself is gone or unusable.
    #[error("database connection error: {0}")]
    Connection(String),

    /// The server rejected a statement (constraint violation, raised exception, ...).
    #[error("database error: {0}")]
    Database(String),

    #[error("column '{column}' could not be decoded: {reason}")]
    Decode { column: String, reason: String },

    #[error("invalid message body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid connection settings: {0}")]
    Settings(String),
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => Self::Database(db.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(e.to_string()),
            sqlx::Error::Configuration(_) => Self::Settings(e.to_string()),
            sqlx::Error::ColumnDecode { index, source } => Self::Decode {
                column: index,
                reason: source.to_string(),
            },
            other => Self::Database(other.to_string()),
        }
    }
}

/// Message-level failures become [`RelayError::Procedure`]; a lost
/// connection stays a [`RelayError::Connection`].
impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::JobNotFound(name) => RelayError::JobNotFound(name),
            StoreError::Connection(reason) => RelayError::Connection(reason),
            other => RelayError::Procedure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_connection_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = StoreError::from(sqlx::Error::Io(io));
        assert!(err.is_connection());
        assert!(matches!(RelayError::from(err), RelayError::Connection(_)));
    }

    #[test]
    fn row_not_found_is_statement_level() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_connection());
        assert!(matches!(RelayError::from(err), RelayError::Procedure(_)));
    }

    #[test]
    fn job_not_found_maps_through() {
        let err = RelayError::from(StoreError::JobNotFound("nightly_sync".into()));
        assert!(matches!(err, RelayError::JobNotFound(name) if name == "nightly_sync"));
    }
}
