//! Error taxonomy shared across the daemon.
//!
//! Transport failures are kept apart from statement-level database errors:
//! the former flip the gateway into its reconnect loop, the latter are routed
//! through the per-task error policy.

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the scheduling core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection or transport failure against the database
    #[error("database transport error: {0}")]
    Transport(#[source] sqlx::Error),
    /// Statement-level database error outside task execution
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    /// A per-task or per-chain deadline fired
    #[error("{scope} timed out after {ms} ms")]
    Timeout {
        /// What was cancelled, e.g. "chain 42" or "task 7"
        scope: String,
        /// The deadline that fired, in milliseconds
        ms: i64,
    },
    /// A task's own execution failed (SQL error, non-zero exit, builtin error)
    #[error("task execution error: {0}")]
    Task(String),
    /// A chain or task failed structural checks at load time
    #[error("validation error: {0}")]
    Validation(String),
    /// Missing or inconsistent startup options
    #[error("configuration error: {0}")]
    Config(String),
    /// An internal invariant was violated; the chain fails, the process continues
    #[error("internal invariant violation: {0}")]
    Invariant(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether a sqlx error is a transport failure rather than a statement error.
pub(crate) fn is_transport(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if is_transport(&err) {
            Error::Transport(err)
        } else {
            Error::Database(err)
        }
    }
}

impl Error {
    /// Build a task execution error
    pub fn task(msg: impl Into<String>) -> Self {
        Error::Task(msg.into())
    }

    /// Build a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Build a timeout error
    pub fn timeout(scope: impl Into<String>, ms: i64) -> Self {
        Error::Timeout {
            scope: scope.into(),
            ms,
        }
    }

    /// True when the error is a transport failure that warrants a reconnect
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let err: Error = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transport());

        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(!err.is_transport());
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::timeout("chain 42", 1500);
        assert_eq!(err.to_string(), "chain 42 timed out after 1500 ms");
    }

    #[test]
    fn test_task_error_message() {
        let err = Error::task("exit code 3");
        assert_eq!(err.to_string(), "task execution error: exit code 3");
    }
}
