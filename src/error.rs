//! Error types for the unified database client.
//!
//! This module defines all error types using `thiserror`. Every driver error is
//! classified into a small taxonomy (`ErrorKind`) so the lifecycle manager can
//! tell transport failures, which degrade the pool, from statement failures,
//! which are surfaced verbatim.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Timeout,
    Syntax,
    Constraint,
    Contention,
    Permission,
    Configuration,
    Transaction,
    Closed,
    InvalidInput,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Syntax => "syntax",
            Self::Constraint => "constraint",
            Self::Contention => "contention",
            Self::Permission => "permission",
            Self::Configuration => "configuration",
            Self::Transaction => "transaction",
            Self::Closed => "closed",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Transport error: {message}")]
    Transport { message: String, suggestion: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Statement rejected: {message}")]
    Syntax {
        message: String,
        /// Backend error code, e.g. "1064" for a MySQL parse error
        code: Option<String>,
    },

    #[error("Constraint violation: {message}")]
    Constraint {
        message: String,
        code: Option<String>,
    },

    /// Lock wait gave up: SQLite busy/locked, MySQL lock wait timeout or deadlock
    #[error("Lock contention: {message}")]
    Contention {
        message: String,
        code: Option<String>,
    },

    #[error("Permission denied: {operation} - {reason}")]
    Permission { operation: String, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Database client is closed: {message}")]
    Closed { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a transport error with a helpful suggestion.
    pub fn transport(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a syntax (statement rejected) error with an optional backend code.
    pub fn syntax(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Syntax {
            message: message.into(),
            code,
        }
    }

    /// Create a constraint violation error.
    pub fn constraint(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Constraint {
            message: message.into(),
            code,
        }
    }

    /// Create a lock contention error.
    pub fn contention(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Contention {
            message: message.into(),
            code,
        }
    }

    /// Create a permission error.
    pub fn permission(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transaction error, typically raised from inside a transactional callback.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a closed error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::Constraint { .. } => ErrorKind::Constraint,
            Self::Contention { .. } => ErrorKind::Contention,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Transaction { .. } => ErrorKind::Transaction,
            Self::Closed { .. } => ErrorKind::Closed,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Transport { suggestion, .. } => Some(suggestion),
            Self::Timeout { .. } => {
                Some("Raise the acquire timeout or the pool limit, or check backend load")
            }
            Self::Syntax { .. } => Some("Check the SQL syntax and referenced objects"),
            Self::Constraint { .. } => Some("The statement conflicts with an existing row or key"),
            Self::Contention { .. } => {
                Some("Another connection holds the lock; retry or raise the busy timeout")
            }
            Self::Permission { .. } => Some("Run writes through execute or a transaction"),
            _ => None,
        }
    }

    /// True for connection-level failures that invalidate the current pool.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Check if this error is retryable at the caller level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Contention { .. }
        )
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_sqlite_contention(code: &str) -> bool {
    code.parse::<i32>()
        .map(|code| matches!(code & 0xff, 5 | 6))
        .unwrap_or(false)
}

/// ER_LOCK_WAIT_TIMEOUT (1205) and ER_LOCK_DEADLOCK (1213).
fn is_mysql_contention(number: u16) -> bool {
    matches!(number, 1205 | 1213)
}

fn is_contention(db_err: &(dyn sqlx::error::DatabaseError + 'static)) -> bool {
    if let Some(mysql) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
        return is_mysql_contention(mysql.number());
    }
    if db_err
        .try_downcast_ref::<sqlx::sqlite::SqliteError>()
        .is_some()
    {
        return db_err.code().is_some_and(|code| is_sqlite_contention(&code));
    }
    false
}

/// Server-side messages that mean the connection itself is gone.
fn is_connection_lost_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("server has gone away")
        || lower.contains("lost connection")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let message = db_err.message().to_string();
                if is_connection_lost_message(&message) {
                    return DbError::transport(message, "The backend dropped the connection");
                }
                if is_contention(db_err.as_ref()) {
                    return DbError::contention(message, code);
                }
                match db_err.kind() {
                    sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation => DbError::constraint(message, code),
                    _ => DbError::syntax(message, code),
                }
            }
            sqlx::Error::RowNotFound => DbError::internal("No rows returned"),
            // sqlx reports the configured acquire timeout only implicitly
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 0),
            sqlx::Error::PoolClosed => DbError::transport(
                "Connection pool is closed",
                "The pool was torn down; retry to use the rebuilt pool",
            ),
            sqlx::Error::Io(io_err) => DbError::transport(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::transport(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::transport(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => DbError::transport(
                "Database worker crashed",
                "The embedded connection worker stopped; the connection will be reopened",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
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
        let err = DbError::transport("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Transport error"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(DbError::timeout("acquire", 10).kind(), ErrorKind::Timeout);
        assert_eq!(DbError::syntax("bad", None).kind(), ErrorKind::Syntax);
        assert_eq!(DbError::closed("gone").kind(), ErrorKind::Closed);
        assert_eq!(ErrorKind::Constraint.to_string(), "constraint");
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::transport("err", "sugg").is_retryable());
        assert!(!DbError::syntax("near SELEC", Some("1064".to_string())).is_retryable());
        assert!(!DbError::constraint("duplicate", None).is_retryable());
    }

    #[test]
    fn test_only_transport_degrades() {
        assert!(DbError::transport("reset", "retry").is_transport());
        assert!(!DbError::timeout("acquire", 10).is_transport());
        assert!(!DbError::closed("shutdown").is_transport());
    }

    #[test]
    fn test_pool_closed_is_transport() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(err.is_transport());
    }

    #[test]
    fn test_pool_timeout_is_timeout() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_io_error_is_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: DbError = sqlx::Error::Io(io).into();
        assert!(err.is_transport());
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_contention_is_retryable_not_transport() {
        let err = DbError::contention("database is locked", Some("5".to_string()));
        assert_eq!(err.kind(), ErrorKind::Contention);
        assert!(err.is_retryable());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_contention_codes() {
        assert!(is_sqlite_contention("5"));
        assert!(is_sqlite_contention("6"));
        // SQLITE_BUSY_SNAPSHOT
        assert!(is_sqlite_contention("517"));
        assert!(!is_sqlite_contention("19"));
        assert!(!is_sqlite_contention("2067"));
        assert!(is_mysql_contention(1205));
        assert!(is_mysql_contention(1213));
        assert!(!is_mysql_contention(1062));
    }

    #[test]
    fn test_permission_is_not_retryable() {
        let err = DbError::permission("INSERT", "read-only");
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_connection_lost_message() {
        assert!(is_connection_lost_message("MySQL server has gone away"));
        assert!(is_connection_lost_message("Lost connection to MySQL server"));
        assert!(!is_connection_lost_message("You have an error in your SQL syntax"));
    }
}
