//! Error types for the toolkit.
//!
//! Every failure the pool, the transaction orchestrator, the JSON pipeline and
//! the repository can produce is a variant of [`DbError`]. Variants carry
//! structured context (field, table, operation) so callers can branch on the
//! kind instead of matching database error text.

use std::time::Duration;
use thiserror::Error;

/// SQLSTATE class for integrity constraint violations.
const CONSTRAINT_VIOLATION_CLASS: &str = "23";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database unavailable after {attempts} connection attempts: {message}")]
    ConnectionUnavailable { attempts: u32, message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Timed out after {timeout_ms}ms waiting for a pooled connection")]
    PoolTimeout { timeout_ms: u64 },

    #[error("Connection pool exhausted: all {max_size} connections are in use")]
    PoolExhausted { max_size: u32 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Transaction aborted{}: {cause}", savepoint_suffix(.savepoint))]
    TransactionAborted {
        savepoint: Option<String>,
        /// The failure reported by COMMIT or RELEASE, kept typed.
        #[source]
        cause: Box<DbError>,
    },

    #[error("{original} (cleanup also failed: {cleanup})")]
    CleanupFailed {
        original: Box<DbError>,
        cleanup: Box<DbError>,
    },

    #[error("Failed to serialize field '{field}': {message}")]
    Serialization { field: String, message: String },

    #[error("Failed to deserialize field '{field}': {message}")]
    Deserialization {
        field: String,
        /// Offending input, truncated for display.
        raw: String,
        message: String,
    },

    #[error("Record not found in '{table}' with key {key}")]
    RecordNotFound { table: String, key: String },

    #[error("Constraint violation{}: {message}", constraint_suffix(.constraint, .table))]
    ConstraintViolation {
        table: Option<String>,
        constraint: Option<String>,
        message: String,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Operation '{operation}' failed: {message}")]
    Operation { operation: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn savepoint_suffix(savepoint: &Option<String>) -> String {
    match savepoint {
        Some(name) => format!(" at savepoint {}", name),
        None => String::new(),
    }
}

fn constraint_suffix(constraint: &Option<String>, table: &Option<String>) -> String {
    match (constraint, table) {
        (Some(c), Some(t)) => format!(" on '{}' ({})", t, c),
        (Some(c), None) => format!(" ({})", c),
        (None, Some(t)) => format!(" on '{}'", t),
        (None, None) => String::new(),
    }
}

/// Longest raw input echoed back in a deserialization error.
const MAX_RAW_ECHO: usize = 200;

fn truncate_raw(raw: &str) -> String {
    if raw.len() <= MAX_RAW_ECHO {
        return raw.to_string();
    }
    let mut end = MAX_RAW_ECHO;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create the error reported once connectivity retries are exhausted.
    pub fn connection_unavailable(attempts: u32, message: impl Into<String>) -> Self {
        Self::ConnectionUnavailable {
            attempts,
            message: message.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn pool_timeout(timeout: Duration) -> Self {
        Self::PoolTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn pool_exhausted(max_size: u32) -> Self {
        Self::PoolExhausted { max_size }
    }

    /// Wrap the failure of a COMMIT or RELEASE SAVEPOINT.
    pub fn transaction_aborted(cause: DbError, savepoint: Option<String>) -> Self {
        Self::TransactionAborted {
            savepoint,
            cause: Box::new(cause),
        }
    }

    /// Combine a body failure with a failure of the teardown that followed it.
    pub fn cleanup_failed(original: DbError, cleanup: DbError) -> Self {
        Self::CleanupFailed {
            original: Box::new(original),
            cleanup: Box::new(cleanup),
        }
    }

    pub fn serialization(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Serialization {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn deserialization(
        field: impl Into<String>,
        raw: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::Deserialization {
            field: field.into(),
            raw: truncate_raw(raw),
            message: message.into(),
        }
    }

    /// Create a record not found error.
    pub fn record_not_found(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::RecordNotFound {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach a table name to errors that carry one and don't have it yet.
    pub fn with_table(self, table: &str) -> Self {
        match self {
            Self::ConstraintViolation {
                table: None,
                constraint,
                message,
            } => Self::ConstraintViolation {
                table: Some(table.to_string()),
                constraint,
                message,
            },
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::ConnectionUnavailable { .. } => {
                Some("Check that the database server is running and reachable")
            }
            Self::PoolTimeout { .. } | Self::PoolExhausted { .. } => {
                Some("Release connections sooner or increase max_size")
            }
            _ => None,
        }
    }

    /// Transient capacity or connectivity problems; the whole operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::PoolTimeout { .. }
                | Self::PoolExhausted { .. }
        )
    }

    /// Conditions no retry will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable { .. } | Self::PoolClosed | Self::Configuration { .. }
        )
    }

    /// Errors after which the underlying connection can no longer be trusted.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// The error the caller should branch on: the body's error when cleanup
    /// failures are attached, the server's error when a commit was aborted.
    pub fn root_cause(&self) -> &DbError {
        match self {
            Self::CleanupFailed { original, .. } => original.root_cause(),
            Self::TransactionAborted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                if code
                    .as_deref()
                    .is_some_and(|c| c.starts_with(CONSTRAINT_VIOLATION_CLASS))
                {
                    return DbError::ConstraintViolation {
                        table: db_err.table().map(String::from),
                        constraint: db_err.constraint().map(String::from),
                        message: db_err.message().to_string(),
                    };
                }
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", Duration::from_secs(30)).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(DbError::pool_timeout(Duration::from_millis(50)).is_retryable());
        assert!(DbError::pool_exhausted(2).is_retryable());
        assert!(!DbError::connection_unavailable(5, "refused").is_retryable());
        assert!(!DbError::record_not_found("users", "1").is_retryable());
    }

    #[test]
    fn test_fatal_errors_are_distinct_from_transient() {
        let fatal = DbError::connection_unavailable(5, "refused");
        assert!(fatal.is_fatal());
        assert!(!DbError::pool_timeout(Duration::from_millis(50)).is_fatal());
        assert!(DbError::PoolClosed.is_fatal());
    }

    #[test]
    fn test_serialization_error_names_field() {
        let err = DbError::serialization("metadata", "unsupported value");
        assert!(err.to_string().contains("'metadata'"));
    }

    #[test]
    fn test_deserialization_error_truncates_raw() {
        let raw = "x".repeat(500);
        let err = DbError::deserialization("payload", &raw, "expected value");
        match err {
            DbError::Deserialization { field, raw, .. } => {
                assert_eq!(field, "payload");
                assert!(raw.len() < 250);
                assert!(raw.ends_with("..."));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_transaction_aborted_keeps_cause() {
        let err = DbError::transaction_aborted(
            DbError::ConstraintViolation {
                table: None,
                constraint: Some("orders_customer_fk".to_string()),
                message: "violates foreign key".to_string(),
            },
            Some("sp_2".to_string()),
        );
        assert!(err.to_string().starts_with("Transaction aborted at savepoint sp_2:"));
        assert!(matches!(err.root_cause(), DbError::ConstraintViolation { .. }));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_cleanup_failed_reports_both() {
        let err = DbError::cleanup_failed(
            DbError::invalid_input("body failed"),
            DbError::internal("drop failed"),
        );
        let text = err.to_string();
        assert!(text.contains("body failed"));
        assert!(text.contains("drop failed"));
        assert!(matches!(err.root_cause(), DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_with_table_fills_constraint_context() {
        let err = DbError::ConstraintViolation {
            table: None,
            constraint: Some("users_email_key".to_string()),
            message: "duplicate key".to_string(),
        }
        .with_table("users");
        assert_eq!(
            err.to_string(),
            "Constraint violation on 'users' (users_email_key): duplicate key"
        );
    }

    #[test]
    fn test_pool_timeout_display_in_millis() {
        let err = DbError::pool_timeout(Duration::from_millis(50));
        assert!(err.to_string().contains("50ms"));
    }
}
