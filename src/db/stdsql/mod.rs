//! Sql backend: a sqlx `PgPool`, one `PoolConnection` per checkout.

pub mod connection;
mod params;
pub mod rows;

pub use connection::{SqlConnection, SqlTransaction};

use crate::config::{Config, DEFAULT_HOST, DEFAULT_PORT, DriverKind, DsnParts, SslMode};
use crate::db::connect_error;
use crate::db::context::Context;
use crate::db::hooks::HookChain;
use crate::db::traits::{Connection, Pool, Provider};
use crate::error::{DatabaseError, DbResult};
use crate::models::{AcquireMetrics, PoolStats};
use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

// ========== Native options ==========

fn pg_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

/// sqlx connect options for one candidate host. Shared with the orm
/// backend, whose handle wraps a sqlx pool.
pub(crate) fn connect_options(parts: &DsnParts, default_ssl: SslMode) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(parts.host.as_deref().unwrap_or(DEFAULT_HOST))
        .port(parts.port.unwrap_or(DEFAULT_PORT))
        .ssl_mode(pg_ssl_mode(parts.ssl_mode.unwrap_or(default_ssl)));
    if let Some(user) = &parts.user {
        options = options.username(user);
    }
    if let Some(password) = &parts.password {
        options = options.password(password);
    }
    if let Some(dbname) = &parts.dbname {
        options = options.database(dbname);
    }
    if let Some(name) = &parts.application_name {
        options = options.application_name(name);
    }
    if !parts.options.is_empty() {
        options = options.options(
            parts
                .options
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
    }
    options
}

pub(crate) fn pool_options(config: &Config) -> PgPoolOptions {
    let nonzero = |d: Duration| Some(d).filter(|d| !d.is_zero());
    let mut options = PgPoolOptions::new()
        .max_connections(config.pool.max_connections)
        .min_connections(config.pool.min_connections)
        .idle_timeout(nonzero(config.pool.max_conn_idle_time))
        .max_lifetime(nonzero(config.pool.max_conn_lifetime))
        .test_before_acquire(config.pool.test_before_acquire);
    if let Some(timeout) = nonzero(config.pool.acquire_timeout) {
        options = options.acquire_timeout(timeout);
    }
    options
}

/// Open a sqlx pool against the first of `candidates` that accepts a
/// connection.
pub(crate) async fn open_pool(
    ctx: &Context,
    config: &Config,
    candidates: Vec<DsnParts>,
    driver: DriverKind,
) -> DbResult<PgPool> {
    let mut last_err = None;
    for parts in &candidates {
        let target = format!(
            "{}:{}",
            parts.host.as_deref().unwrap_or(DEFAULT_HOST),
            parts.port.unwrap_or(DEFAULT_PORT)
        );
        let options = connect_options(parts, config.ssl_mode);
        let check_ctx = ctx.bounded(config.timeouts.connect);
        // connect_with checks one connection out before returning
        let opened = check_ctx
            .run("connect", async {
                pool_options(config)
                    .connect_with(options)
                    .await
                    .map_err(DatabaseError::from)
            })
            .await;
        match opened {
            Ok(pool) => {
                info!(
                    driver = %driver,
                    target = %target,
                    max_connections = config.pool.max_connections,
                    "Connected to database"
                );
                return Ok(pool);
            }
            Err(err) => {
                warn!(target = %target, error = %err, "Connection attempt failed");
                last_err = Some(connect_error(&target, err));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| DatabaseError::connection_failed("no connection candidates")))
}

// ========== Pool ==========

pub struct SqlPool {
    pool: RwLock<Option<PgPool>>,
    hooks: Arc<HookChain>,
    query_timeout: Duration,
    metrics: AcquireMetrics,
}

impl SqlPool {
    pub(crate) fn new(pool: PgPool, config: &Config) -> Self {
        Self {
            pool: RwLock::new(Some(pool)),
            hooks: Arc::new(HookChain::from_config(config)),
            query_timeout: config.timeouts.query,
            metrics: AcquireMetrics::new(),
        }
    }

    fn handle(&self) -> DbResult<PgPool> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| DatabaseError::connection_failed("connection pool is closed"))
    }
}

#[async_trait]
impl Pool for SqlPool {
    async fn acquire(&self, ctx: &Context) -> DbResult<Box<dyn Connection>> {
        let pool = self.handle()?;
        let started = Instant::now();
        let was_empty = pool.num_idle() == 0;
        let acquired = ctx
            .run("acquire connection", async {
                pool.acquire().await.map_err(DatabaseError::from)
            })
            .await;
        let conn = match acquired {
            Ok(conn) => conn,
            Err(err) => {
                if ctx.is_done() {
                    self.metrics.record_canceled();
                }
                return Err(err);
            }
        };
        self.metrics.record(started, was_empty);

        let mut conn = SqlConnection::new(conn, Arc::clone(&self.hooks), self.query_timeout);
        if let Err(err) = conn.after_acquire_hook(ctx).await {
            warn!(error = %err, "After-acquire hook failed");
        }
        Ok(Box::new(conn))
    }

    fn stats(&self) -> PoolStats {
        let Some(pool) = self.pool.read().clone() else {
            return PoolStats::default();
        };
        let total = pool.size();
        let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX);
        let mut stats = PoolStats {
            acquired_conns: total.saturating_sub(idle),
            idle_conns: idle,
            max_conns: pool.options().get_max_connections(),
            total_conns: total,
            ..PoolStats::default()
        };
        self.metrics.fill(&mut stats);
        stats
    }

    async fn close(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("Connection pool closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.pool.read().is_none()
    }

    fn driver(&self) -> DriverKind {
        DriverKind::Sql
    }
}

// ========== Provider ==========

pub struct SqlProvider {
    config: Config,
    pool: tokio::sync::RwLock<Option<Arc<SqlPool>>>,
}

impl SqlProvider {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            pool: tokio::sync::RwLock::new(None),
        }
    }
}

#[async_trait]
impl Provider for SqlProvider {
    fn driver(&self) -> DriverKind {
        DriverKind::Sql
    }

    fn config(&self) -> &Config {
        &self.config
    }

    async fn connect(&self, ctx: &Context) -> DbResult<()> {
        let mut slot = self.pool.write().await;
        if slot.is_some() {
            return Ok(());
        }
        let candidates = self
            .config
            .connect_candidates()
            .map_err(|e| connect_error("configured DSN", e.into()))?;
        let pool = open_pool(ctx, &self.config, candidates, DriverKind::Sql).await?;
        *slot = Some(Arc::new(SqlPool::new(pool, &self.config)));
        Ok(())
    }

    async fn close(&self) -> DbResult<()> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(driver = %DriverKind::Sql, "Disconnected from database");
        }
        Ok(())
    }

    async fn pool(&self) -> Option<Arc<dyn Pool>> {
        self.pool
            .read()
            .await
            .clone()
            .map(|pool| pool as Arc<dyn Pool>)
    }

    async fn is_connected(&self) -> bool {
        self.pool
            .read()
            .await
            .as_ref()
            .is_some_and(|pool| !pool.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_connect_options_from_parts() {
        let config = Config::default()
            .with_host("db1", 6543)
            .with_credentials("app", "secret")
            .with_database("orders")
            .with_timezone("UTC");
        let parts = config.connect_candidates().unwrap().remove(0);
        let options = connect_options(&parts, SslMode::Disable);

        assert_eq!(options.get_host(), "db1");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_username(), "app");
        assert_eq!(options.get_database(), Some("orders"));
        assert_eq!(options.get_application_name(), Some("pgbridge"));
        assert!(matches!(options.get_ssl_mode(), PgSslMode::Disable));
        assert_eq!(options.get_options(), Some("-c timezone=UTC"));
    }

    #[test]
    fn test_pool_options() {
        let mut config = Config::default().with_pool_size(2, 8);
        config.pool.max_conn_idle_time = Duration::ZERO;
        let options = pool_options(&config);
        assert_eq!(options.get_max_connections(), 8);
        assert_eq!(options.get_min_connections(), 2);
        assert_eq!(options.get_idle_timeout(), None);
        assert_eq!(options.get_max_lifetime(), Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_close_without_connect() {
        let provider = SqlProvider::new(Config::default());
        assert!(!provider.is_connected().await);
        provider.close().await.unwrap();
        assert!(provider.pool().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_failed() {
        let mut config = Config::default().with_host("127.0.0.1", 1);
        config.timeouts.connect = Duration::from_secs(2);
        config.pool.acquire_timeout = Duration::from_secs(2);
        let provider = SqlProvider::new(config);

        let err = provider.connect(&Context::background()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(!provider.is_connected().await);
    }
}
