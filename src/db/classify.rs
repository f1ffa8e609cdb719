//! Error classification.
//!
//! [`classify`] maps any backend error to an [`ErrorKind`] plus a short
//! detail string. The checks run in a fixed order and the first match wins:
//!
//! 1. typed sentinels of the drivers (and already classified errors),
//! 2. network errors without an OS code (timeouts, socket failures),
//! 3. OS error codes,
//! 4. SQLSTATE codes of server errors,
//! 5. substring rules over the lower-cased message.
//!
//! Each step looks at the whole `source()` chain before the next step runs.
//! Step 5 is a heuristic over English server messages; localized servers or
//! reworded messages in future versions can fall through to `Unknown`.

use crate::error::{DatabaseError, ErrorKind};
use deadpool_postgres::PoolError;
use sea_orm::{ConnAcquireErr, DbErr, RuntimeErr};
use std::error::Error as StdError;
use std::io;

type Classified = (ErrorKind, String);

/// Classify an error and keep it as the source of the returned `DatabaseError`.
pub fn wrap<E>(err: E) -> DatabaseError
where
    E: StdError + Send + Sync + 'static,
{
    let (kind, detail) = classify(&err);
    let message = err.to_string();
    DatabaseError::with_source(kind, message, err).detail(detail)
}

/// Map an error to its kind and a detail string.
pub fn classify(err: &(dyn StdError + 'static)) -> Classified {
    let chain: Vec<&(dyn StdError + 'static)> = chain(err).collect();

    if let Some(found) = chain.iter().find_map(|e| sentinel(*e)) {
        return found;
    }
    if let Some(found) = chain.iter().find_map(|e| network(*e)) {
        return found;
    }
    if let Some(found) = chain.iter().find_map(|e| os_error(*e)) {
        return found;
    }
    if let Some(code) = chain.iter().find_map(|e| sqlstate(*e)) {
        if let Some(kind) = sqlstate_kind(&code) {
            return (kind, format!("SQLSTATE {code}"));
        }
    }
    for e in &chain {
        let message = e.to_string();
        if let Some(kind) = classify_message(&message) {
            return (kind, message);
        }
    }
    (ErrorKind::Unknown, err.to_string())
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

// ========== Step 1: typed sentinels ==========

fn sentinel(err: &(dyn StdError + 'static)) -> Option<Classified> {
    if let Some(db_err) = err.downcast_ref::<DatabaseError>() {
        return Some((
            db_err.kind(),
            db_err.detail_text().unwrap_or(db_err.message()).to_string(),
        ));
    }
    if let Some(db_err) = err.downcast_ref::<DbErr>() {
        return orm_sentinel(db_err);
    }
    if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
        return sqlx_sentinel(sqlx_err);
    }
    if let Some(pool_err) = err.downcast_ref::<PoolError>() {
        return pool_sentinel(pool_err);
    }
    if let Some(pg_err) = err.downcast_ref::<tokio_postgres::Error>() {
        if pg_err.is_closed() {
            return Some((ErrorKind::ConnectionLost, "connection closed".to_string()));
        }
    }
    None
}

fn orm_sentinel(err: &DbErr) -> Option<Classified> {
    let found = match err {
        DbErr::RecordNotFound(what) => (ErrorKind::RecordNotFound, what.clone()),
        DbErr::RecordNotInserted => (ErrorKind::RecordNotFound, "record not inserted".into()),
        DbErr::RecordNotUpdated => (ErrorKind::RecordNotFound, "record not updated".into()),
        DbErr::ConnectionAcquire(ConnAcquireErr::Timeout) => {
            (ErrorKind::PoolExhausted, "connection acquire timeout".into())
        }
        DbErr::ConnectionAcquire(ConnAcquireErr::ConnectionClosed) => {
            (ErrorKind::ConnectionLost, "connection closed".into())
        }
        DbErr::Conn(RuntimeErr::SqlxError(inner))
        | DbErr::Exec(RuntimeErr::SqlxError(inner))
        | DbErr::Query(RuntimeErr::SqlxError(inner)) => return Some(classify(inner)),
        DbErr::Type(msg) => (ErrorKind::InvalidData, msg.clone()),
        DbErr::Json(msg) => (ErrorKind::InvalidData, msg.clone()),
        DbErr::TryIntoErr { .. } => (ErrorKind::InvalidData, err.to_string()),
        DbErr::AttrNotSet(attr) => (ErrorKind::InvalidValue, attr.clone()),
        _ => return None,
    };
    Some(found)
}

fn sqlx_sentinel(err: &sqlx::Error) -> Option<Classified> {
    let found = match err {
        sqlx::Error::RowNotFound => (ErrorKind::RecordNotFound, "no rows returned".into()),
        sqlx::Error::PoolTimedOut => (ErrorKind::PoolExhausted, "pool timed out".into()),
        sqlx::Error::PoolClosed => (ErrorKind::ConnectionFailed, "pool closed".into()),
        sqlx::Error::WorkerCrashed => (ErrorKind::ConnectionLost, "worker crashed".into()),
        sqlx::Error::Configuration(e) => (ErrorKind::Configuration, e.to_string()),
        sqlx::Error::Tls(e) => (ErrorKind::ConnectionFailed, e.to_string()),
        sqlx::Error::Protocol(msg) => (ErrorKind::ConnectionLost, msg.clone()),
        sqlx::Error::ColumnNotFound(col) => (ErrorKind::UndefinedColumn, col.clone()),
        sqlx::Error::ColumnIndexOutOfBounds { index, len } => (
            ErrorKind::UndefinedColumn,
            format!("column index {index} out of bounds ({len} columns)"),
        ),
        sqlx::Error::TypeNotFound { type_name } => {
            (ErrorKind::DataTypeMismatch, type_name.clone())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            (ErrorKind::InvalidData, err.to_string())
        }
        sqlx::Error::Encode(_) => (ErrorKind::InvalidValue, err.to_string()),
        sqlx::Error::BeginFailed | sqlx::Error::InvalidSavePointStatement => {
            (ErrorKind::InvalidTransactionState, err.to_string())
        }
        _ => return None,
    };
    Some(found)
}

fn pool_sentinel(err: &PoolError) -> Option<Classified> {
    use deadpool_postgres::TimeoutType;

    let found = match err {
        PoolError::Timeout(TimeoutType::Wait) => {
            (ErrorKind::PoolExhausted, "timed out waiting for a connection".into())
        }
        PoolError::Timeout(TimeoutType::Create) => {
            (ErrorKind::ConnectionTimeout, "timed out creating a connection".into())
        }
        PoolError::Timeout(TimeoutType::Recycle) => {
            (ErrorKind::ConnectionTimeout, "timed out recycling a connection".into())
        }
        PoolError::Closed => (ErrorKind::ConnectionFailed, "pool closed".into()),
        PoolError::NoRuntimeSpecified => {
            (ErrorKind::Configuration, "no runtime specified".into())
        }
        PoolError::Backend(inner) => return Some(classify(inner)),
        _ => return None,
    };
    Some(found)
}

// ========== Step 2: network errors ==========

fn network(err: &(dyn StdError + 'static)) -> Option<Classified> {
    if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return Some((ErrorKind::ConnectionTimeout, "deadline elapsed".to_string()));
    }
    let io_err = err.downcast_ref::<io::Error>()?;
    if io_err.raw_os_error().is_some() || !is_network_kind(io_err.kind()) {
        return None;
    }
    let kind = match io_err.kind() {
        io::ErrorKind::TimedOut => ErrorKind::ConnectionTimeout,
        _ => ErrorKind::ConnectionFailed,
    };
    Some((kind, io_err.to_string()))
}

fn is_network_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::AddrInUse
            | io::ErrorKind::AddrNotAvailable
    )
}

// ========== Step 3: OS error codes ==========

fn os_error(err: &(dyn StdError + 'static)) -> Option<Classified> {
    let io_err = err.downcast_ref::<io::Error>()?;
    let code = io_err.raw_os_error()?;
    let kind = match io_err.kind() {
        io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
        io::ErrorKind::TimedOut => ErrorKind::ConnectionTimeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionLost,
        _ => ErrorKind::SystemError,
    };
    Some((kind, format!("os error {code}")))
}

// ========== Step 4: SQLSTATE ==========

fn sqlstate(err: &(dyn StdError + 'static)) -> Option<String> {
    if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
        if let sqlx::Error::Database(db_err) = sqlx_err {
            return db_err.code().map(|c| c.into_owned());
        }
        return None;
    }
    if let Some(pg_err) = err.downcast_ref::<tokio_postgres::Error>() {
        return pg_err.code().map(|c| c.code().to_string());
    }
    if let Some(db_err) = err.downcast_ref::<tokio_postgres::error::DbError>() {
        return Some(db_err.code().code().to_string());
    }
    None
}

/// Fixed SQLSTATE table.
pub fn sqlstate_kind(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        "23505" => ErrorKind::UniqueViolation,
        "23503" => ErrorKind::ForeignKeyViolation,
        "23502" => ErrorKind::NotNullViolation,
        "23514" => ErrorKind::CheckViolation,

        "40001" => ErrorKind::SerializationFailure,
        "40P01" => ErrorKind::DeadlockDetected,
        "25P02" => ErrorKind::TransactionAborted,
        "42601" => ErrorKind::SyntaxError,
        "42P01" => ErrorKind::UndefinedTable,
        "42703" => ErrorKind::UndefinedColumn,
        "42883" => ErrorKind::UndefinedFunction,
        "42804" => ErrorKind::DataTypeMismatch,

        "22012" => ErrorKind::DivisionByZero,
        "22001" => ErrorKind::StringDataRightTruncation,
        "22003" => ErrorKind::NumericValueOutOfRange,
        "22P02" => ErrorKind::InvalidTextRepresentation,
        "22007" | "22008" => ErrorKind::InvalidDatetimeFormat,

        "28000" | "28P01" => ErrorKind::AuthenticationFailed,
        "53300" => ErrorKind::PoolExhausted,
        "53100" => ErrorKind::DiskFull,
        "53200" => ErrorKind::InsufficientMemory,
        "57014" => ErrorKind::Cancelled,
        "57P01" | "57P02" | "57P03" => ErrorKind::ConnectionLost,
        "08003" | "08006" => ErrorKind::ConnectionLost,
        "3D000" => ErrorKind::ConnectionFailed,

        c if c.starts_with("40") => ErrorKind::TransactionRollback,
        c if c.starts_with("25") => ErrorKind::InvalidTransactionState,
        c if c.starts_with("08") => ErrorKind::ConnectionFailed,
        c if c.starts_with("58") => ErrorKind::SystemError,
        _ => return None,
    };
    Some(kind)
}

// ========== Step 5: message rules ==========

/// One rule: the kind matches when every substring of any group is present.
struct MessageRule {
    kind: ErrorKind,
    any_of: &'static [&'static [&'static str]],
}

const fn rule(kind: ErrorKind, any_of: &'static [&'static [&'static str]]) -> MessageRule {
    MessageRule { kind, any_of }
}

/// Ordered: more specific rules come before general ones.
static MESSAGE_RULES: &[MessageRule] = &[
    // Not-found sentinel text
    rule(
        ErrorKind::RecordNotFound,
        &[&["record not found"], &["no rows in result set"], &["no rows returned"]],
    ),
    // Connection, authentication, pool
    rule(
        ErrorKind::AuthenticationFailed,
        &[
            &["authentication failed"],
            &["no pg_hba.conf entry"],
            &["invalid password"],
        ],
    ),
    rule(
        ErrorKind::PoolExhausted,
        &[
            &["too many connections"],
            &["remaining connection slots are reserved"],
            &["pool timed out"],
            &["pool exhausted"],
        ],
    ),
    rule(ErrorKind::ConnectionRefused, &[&["connection refused"]]),
    rule(
        ErrorKind::ConnectionLost,
        &[
            &["connection reset"],
            &["broken pipe"],
            &["connection closed"],
            &["server closed the connection"],
            &["terminating connection"],
            &["unexpected eof"],
        ],
    ),
    rule(
        ErrorKind::ConnectionTimeout,
        &[&["timed out"], &["timeout"], &["deadline exceeded"]],
    ),
    rule(
        ErrorKind::ConnectionFailed,
        &[
            &["could not connect"],
            &["failed to connect"],
            &["connection failed"],
            &["could not translate host name"],
            &["no such host"],
        ],
    ),
    // Syntax and schema; column before table because column messages name
    // their relation too.
    rule(ErrorKind::SyntaxError, &[&["syntax error"]]),
    rule(
        ErrorKind::UndefinedColumn,
        &[&["column", "does not exist"], &["no such column"]],
    ),
    rule(ErrorKind::UndefinedFunction, &[&["function", "does not exist"]]),
    rule(
        ErrorKind::UndefinedTable,
        &[
            &["relation", "does not exist"],
            &["table", "does not exist"],
            &["no such table"],
        ],
    ),
    rule(
        ErrorKind::DataTypeMismatch,
        &[
            &["is of type", "but expression is of type"],
            &["operator does not exist"],
            &["type mismatch"],
            &["mismatched types"],
        ],
    ),
    rule(ErrorKind::DivisionByZero, &[&["division by zero"]]),
    // Data representation; datetime before the generic range and syntax rules
    rule(
        ErrorKind::StringDataRightTruncation,
        &[&["value too long"], &["string data right truncation"]],
    ),
    rule(
        ErrorKind::InvalidDatetimeFormat,
        &[
            &["date/time field value out of range"],
            &["invalid input syntax for type date"],
            &["invalid input syntax for type time"],
            &["invalid datetime format"],
        ],
    ),
    rule(ErrorKind::NumericValueOutOfRange, &[&["out of range"]]),
    rule(
        ErrorKind::InvalidTextRepresentation,
        &[&["invalid input syntax"], &["invalid input value"]],
    ),
    // Constraints
    rule(
        ErrorKind::UniqueViolation,
        &[&["duplicate key"], &["unique constraint"], &["unique violation"]],
    ),
    rule(
        ErrorKind::ForeignKeyViolation,
        &[&["foreign key constraint"], &["foreign key violation"]],
    ),
    rule(
        ErrorKind::NotNullViolation,
        &[
            &["null value in column"],
            &["not-null constraint"],
            &["not null constraint"],
            &["not null violation"],
        ],
    ),
    rule(
        ErrorKind::CheckViolation,
        &[&["check constraint"], &["check violation"]],
    ),
    // Transactions; deadlock before the generic rollback rule
    rule(ErrorKind::DeadlockDetected, &[&["deadlock"]]),
    rule(
        ErrorKind::SerializationFailure,
        &[&["could not serialize"], &["serialization failure"]],
    ),
    rule(
        ErrorKind::TransactionAborted,
        &[&["current transaction is aborted"], &["transaction aborted"]],
    ),
    rule(
        ErrorKind::InvalidTransactionState,
        &[
            &["invalid transaction state"],
            &["there is no transaction in progress"],
            &["there is already a transaction in progress"],
            &["transaction has already been committed or rolled back"],
        ],
    ),
    rule(ErrorKind::InvalidTransaction, &[&["invalid transaction"]]),
    rule(
        ErrorKind::TransactionRollback,
        &[&["transaction", "rollback"], &["transaction", "rolled back"]],
    ),
    // System resources
    rule(
        ErrorKind::DiskFull,
        &[&["no space left"], &["disk full"], &["could not extend file"]],
    ),
    rule(
        ErrorKind::InsufficientMemory,
        &[&["out of memory"], &["insufficient memory"]],
    ),
    rule(
        ErrorKind::SystemError,
        &[&["system error"], &["i/o error"], &["could not open file"]],
    ),
];

/// Apply the ordered message rules to `message`.
pub fn classify_message(message: &str) -> Option<ErrorKind> {
    let lower = message.to_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|rule| {
            rule.any_of
                .iter()
                .any(|group| group.iter().all(|needle| lower.contains(needle)))
        })
        .map(|rule| rule.kind)
}
