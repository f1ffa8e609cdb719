//! Error types for pgbridge.
//!
//! Every error an adapter surfaces is a [`DatabaseError`] carrying exactly one
//! [`ErrorKind`]. Backend errors are turned into `DatabaseError`s by the
//! classifier in [`crate::db::classify`]; the original error stays reachable
//! through [`std::error::Error::source`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Normalized error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Connection
    ConnectionFailed,
    ConnectionLost,
    ConnectionTimeout,
    ConnectionRefused,
    PoolExhausted,
    AuthenticationFailed,
    ConnectionReleased,

    // Query / schema
    SyntaxError,
    UndefinedTable,
    UndefinedColumn,
    UndefinedFunction,
    DataTypeMismatch,
    DivisionByZero,

    // Constraints
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    CheckViolation,

    // Transactions
    TransactionRollback,
    SerializationFailure,
    DeadlockDetected,
    TransactionAborted,
    InvalidTransactionState,

    // Data
    StringDataRightTruncation,
    NumericValueOutOfRange,
    InvalidTextRepresentation,
    InvalidDatetimeFormat,

    // System
    DiskFull,
    InsufficientMemory,
    SystemError,

    // ORM sentinels
    RecordNotFound,
    InvalidTransaction,
    InvalidData,
    InvalidValue,

    // Backend capabilities
    Unsupported,
    BatchUnsupported,
    NoMoreResults,

    Cancelled,
    Configuration,
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: &'static [ErrorKind] = &[
        Self::ConnectionFailed,
        Self::ConnectionLost,
        Self::ConnectionTimeout,
        Self::ConnectionRefused,
        Self::PoolExhausted,
        Self::AuthenticationFailed,
        Self::ConnectionReleased,
        Self::SyntaxError,
        Self::UndefinedTable,
        Self::UndefinedColumn,
        Self::UndefinedFunction,
        Self::DataTypeMismatch,
        Self::DivisionByZero,
        Self::UniqueViolation,
        Self::ForeignKeyViolation,
        Self::NotNullViolation,
        Self::CheckViolation,
        Self::TransactionRollback,
        Self::SerializationFailure,
        Self::DeadlockDetected,
        Self::TransactionAborted,
        Self::InvalidTransactionState,
        Self::StringDataRightTruncation,
        Self::NumericValueOutOfRange,
        Self::InvalidTextRepresentation,
        Self::InvalidDatetimeFormat,
        Self::DiskFull,
        Self::InsufficientMemory,
        Self::SystemError,
        Self::RecordNotFound,
        Self::InvalidTransaction,
        Self::InvalidData,
        Self::InvalidValue,
        Self::Unsupported,
        Self::BatchUnsupported,
        Self::NoMoreResults,
        Self::Cancelled,
        Self::Configuration,
        Self::Unknown,
    ];

    /// Stable snake_case name, also used by `Display`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "connection_failed",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionTimeout => "connection_timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::PoolExhausted => "pool_exhausted",
            Self::AuthenticationFailed => "authentication_failed",
            Self::ConnectionReleased => "connection_released",
            Self::SyntaxError => "syntax_error",
            Self::UndefinedTable => "undefined_table",
            Self::UndefinedColumn => "undefined_column",
            Self::UndefinedFunction => "undefined_function",
            Self::DataTypeMismatch => "data_type_mismatch",
            Self::DivisionByZero => "division_by_zero",
            Self::UniqueViolation => "unique_violation",
            Self::ForeignKeyViolation => "foreign_key_violation",
            Self::NotNullViolation => "not_null_violation",
            Self::CheckViolation => "check_violation",
            Self::TransactionRollback => "transaction_rollback",
            Self::SerializationFailure => "serialization_failure",
            Self::DeadlockDetected => "deadlock_detected",
            Self::TransactionAborted => "transaction_aborted",
            Self::InvalidTransactionState => "invalid_transaction_state",
            Self::StringDataRightTruncation => "string_data_right_truncation",
            Self::NumericValueOutOfRange => "numeric_value_out_of_range",
            Self::InvalidTextRepresentation => "invalid_text_representation",
            Self::InvalidDatetimeFormat => "invalid_datetime_format",
            Self::DiskFull => "disk_full",
            Self::InsufficientMemory => "insufficient_memory",
            Self::SystemError => "system_error",
            Self::RecordNotFound => "record_not_found",
            Self::InvalidTransaction => "invalid_transaction",
            Self::InvalidData => "invalid_data",
            Self::InvalidValue => "invalid_value",
            Self::Unsupported => "unsupported",
            Self::BatchUnsupported => "batch_unsupported",
            Self::NoMoreResults => "no_more_results",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        }
    }

    /// Connection-level failures, including use of a released connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed
                | Self::ConnectionLost
                | Self::ConnectionTimeout
                | Self::ConnectionRefused
                | Self::PoolExhausted
                | Self::AuthenticationFailed
                | Self::ConnectionReleased
        )
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::UniqueViolation
                | Self::ForeignKeyViolation
                | Self::NotNullViolation
                | Self::CheckViolation
        )
    }

    pub fn is_transaction_error(&self) -> bool {
        matches!(
            self,
            Self::TransactionRollback
                | Self::SerializationFailure
                | Self::DeadlockDetected
                | Self::TransactionAborted
                | Self::InvalidTransactionState
                | Self::InvalidTransaction
        )
    }

    /// Whether a caller-level retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout
                | Self::ConnectionLost
                | Self::PoolExhausted
                | Self::SerializationFailure
                | Self::DeadlockDetected
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RecordNotFound)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A classified database error.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct DatabaseError {
    kind: ErrorKind,
    message: String,
    detail: Option<String>,
    #[source]
    source: Option<BoxError>,
}

impl DatabaseError {
    /// Create an error with no underlying cause.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            source: None,
        }
    }

    /// Create an error wrapping the original cause.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            source: Some(source.into()),
        }
    }

    /// Attach a detail string.
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    // ========== Constructors ==========

    pub fn released() -> Self {
        Self::new(ErrorKind::ConnectionReleased, "connection has been released")
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn batch_unsupported(driver: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::BatchUnsupported,
            format!("batched statements are not supported by the {driver} driver"),
        )
    }

    pub fn no_more_results() -> Self {
        Self::new(ErrorKind::NoMoreResults, "no more queries in batch")
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValue, message)
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidData, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RecordNotFound, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed, message)
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(
            ErrorKind::ConnectionTimeout,
            format!("{operation} exceeded its deadline"),
        )
    }

    pub fn cancelled(operation: &str) -> Self {
        Self::new(ErrorKind::Cancelled, format!("{operation} was cancelled"))
    }

    pub fn transaction_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTransactionState, message)
    }

    // ========== Accessors ==========

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail_text(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// The underlying backend error, if any.
    pub fn original_cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    // ========== Predicates ==========

    pub fn is_connection_error(&self) -> bool {
        self.kind.is_connection_error()
    }

    pub fn is_constraint_violation(&self) -> bool {
        self.kind.is_constraint_violation()
    }

    pub fn is_transaction_error(&self) -> bool {
        self.kind.is_transaction_error()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind.is_not_found()
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DatabaseError>;

// ========== Predicates over arbitrary errors ==========

/// Kind of any error: a `DatabaseError` keeps its kind, anything else is
/// classified.
pub fn kind_of(err: &(dyn std::error::Error + 'static)) -> ErrorKind {
    match err.downcast_ref::<DatabaseError>() {
        Some(db_err) => db_err.kind(),
        None => crate::db::classify::classify(err).0,
    }
}

pub fn is_connection_error(err: &(dyn std::error::Error + 'static)) -> bool {
    kind_of(err).is_connection_error()
}

pub fn is_constraint_violation(err: &(dyn std::error::Error + 'static)) -> bool {
    kind_of(err).is_constraint_violation()
}

pub fn is_transaction_error(err: &(dyn std::error::Error + 'static)) -> bool {
    kind_of(err).is_transaction_error()
}

pub fn is_retryable(err: &(dyn std::error::Error + 'static)) -> bool {
    kind_of(err).is_retryable()
}

pub fn is_not_found(err: &(dyn std::error::Error + 'static)) -> bool {
    kind_of(err).is_not_found()
}

// ========== Conversions from backend errors ==========

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        crate::db::classify::wrap(err)
    }
}

impl From<tokio_postgres::Error> for DatabaseError {
    fn from(err: tokio_postgres::Error) -> Self {
        crate::db::classify::wrap(err)
    }
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        crate::db::classify::wrap(err)
    }
}

impl From<sea_orm::DbErr> for DatabaseError {
    fn from(err: sea_orm::DbErr) -> Self {
        crate::db::classify::wrap(err)
    }
}

impl From<crate::config::ConfigError> for DatabaseError {
    fn from(err: crate::config::ConfigError) -> Self {
        let message = err.to_string();
        Self::with_source(ErrorKind::Configuration, message, err)
    }
}
