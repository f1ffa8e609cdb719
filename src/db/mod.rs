//! Database access layer.
//!
//! This module provides:
//! - The driver-agnostic contract (`traits`)
//! - Three backends: `pgwire` (tokio-postgres + deadpool), `orm` (sea-orm)
//!   and `stdsql` (sqlx)
//! - Request contexts, lifecycle hooks, batches and nested transactions
//! - Error classification and caller-side retries

pub mod batch;
pub mod classify;
pub mod context;
pub mod hooks;
pub mod nested;
pub mod orm;
pub mod pgwire;
pub mod retry;
pub mod row;
pub mod stdsql;
pub mod traits;
pub mod types;

pub use batch::{Batch, QueuedStatement};
pub use context::Context;
pub use hooks::{HookChain, HookExecutor, HookPhase, HookStep};
pub use nested::NestedTransaction;
pub use orm::OrmProvider;
pub use pgwire::WireProvider;
pub use retry::retry;
pub use stdsql::SqlProvider;
pub use traits::{
    BatchResults, ConnHandle, Connection, Pool, Provider, Queryer, QueryerExt, Row, Rows,
    Transaction, get_conn_with_not_present,
};

use crate::config::{Config, DriverKind};
use crate::error::{DatabaseError, DbResult, ErrorKind};
use tracing::info;

/// Validate `config` and build the provider for `config.driver`.
///
/// The provider is not connected yet; call [`Provider::connect`].
pub fn new_provider(config: Config) -> DbResult<Box<dyn Provider>> {
    config.validate()?;
    info!(driver = %config.driver, "Creating database provider");
    let provider: Box<dyn Provider> = match config.driver {
        DriverKind::Wire => Box::new(WireProvider::new(config)),
        DriverKind::Orm => Box::new(OrmProvider::new(config)),
        DriverKind::Sql => Box::new(SqlProvider::new(config)),
    };
    Ok(provider)
}

/// Connect failures are always `ConnectionFailed`; the classified cause
/// stays reachable as the source and is summarized in the detail.
pub(crate) fn connect_error(target: &str, cause: DatabaseError) -> DatabaseError {
    let detail = format!("{}: {}", cause.kind(), cause.message());
    DatabaseError::with_source(
        ErrorKind::ConnectionFailed,
        format!("failed to connect to {target}"),
        cause,
    )
    .detail(detail)
}

/// True for `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Savepoint names are spliced into SQL, so only plain identifiers pass.
pub(crate) fn validate_savepoint_name(name: &str) -> DbResult<&str> {
    if is_plain_identifier(name) {
        Ok(name)
    } else {
        Err(DatabaseError::invalid_value(format!(
            "invalid savepoint name '{name}': expected a plain SQL identifier"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_plain_identifier() {
        assert!(is_plain_identifier("sp1"));
        assert!(is_plain_identifier("_sp"));
        assert!(is_plain_identifier("Before_Update"));
        assert!(!is_plain_identifier(""));
        assert!(!is_plain_identifier("1sp"));
        assert!(!is_plain_identifier("sp-1"));
        assert!(!is_plain_identifier("sp; DROP TABLE users"));
        assert!(!is_plain_identifier("\"quoted\""));
    }

    #[test]
    fn test_validate_savepoint_name() {
        assert_eq!(validate_savepoint_name("sp_a").unwrap(), "sp_a");
        let err = validate_savepoint_name("a b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_connect_error_keeps_cause() {
        let cause = DatabaseError::new(ErrorKind::AuthenticationFailed, "bad password");
        let err = connect_error("db:5432", cause);
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(err.message(), "failed to connect to db:5432");
        assert!(err.detail_text().unwrap().contains("bad password"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("bad password"));
    }

    #[test]
    fn test_new_provider_rejects_invalid_config() {
        let config = Config::default().with_pool_size(5, 2);
        let err = new_provider(config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_new_provider_selects_driver() {
        for driver in [DriverKind::Wire, DriverKind::Orm, DriverKind::Sql] {
            let provider = new_provider(Config::default().with_driver(driver)).unwrap();
            assert_eq!(provider.driver(), driver);
            assert!(!provider.is_connected().await);
            assert!(provider.pool().await.is_none());
            provider.close().await.unwrap();
        }
    }
}
