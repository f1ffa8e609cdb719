//! Orm backend: a sea-orm `DatabaseConnection` over a sqlx pool.
//!
//! The handle sends each statement to whichever pooled session is free, so
//! the tenant id never goes into session state here. It is set with
//! `set_config(.., true)` at the start of every transaction instead, and
//! statements outside a transaction run without a tenant.

pub mod connection;

pub use connection::{OrmConnection, OrmTransaction};

use crate::config::{Config, DriverKind};
use crate::db::connect_error;
use crate::db::context::Context;
use crate::db::hooks::HookChain;
use crate::db::stdsql::open_pool;
use crate::db::traits::{Connection, Pool, Provider};
use crate::error::{DatabaseError, DbResult};
use crate::models::{AcquireMetrics, PoolStats};
use async_trait::async_trait;
use parking_lot::RwLock;
use sea_orm::{DatabaseConnection, SqlxPostgresConnector};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

// ========== Pool ==========

struct OrmHandle {
    db: DatabaseConnection,
    // same pool the handle wraps, kept for statistics
    pool: PgPool,
}

pub struct OrmPool {
    handle: RwLock<Option<Arc<OrmHandle>>>,
    hooks: Arc<HookChain>,
    query_timeout: Duration,
    metrics: AcquireMetrics,
}

impl OrmPool {
    pub(crate) fn new(pool: PgPool, config: &Config) -> Self {
        let db = SqlxPostgresConnector::from_sqlx_postgres_pool(pool.clone());
        Self {
            handle: RwLock::new(Some(Arc::new(OrmHandle { db, pool }))),
            hooks: Arc::new(HookChain::from_config(config).transaction_scoped_tenant()),
            query_timeout: config.timeouts.query,
            metrics: AcquireMetrics::new(),
        }
    }

    fn handle(&self) -> DbResult<Arc<OrmHandle>> {
        self.handle
            .read()
            .clone()
            .ok_or_else(|| DatabaseError::connection_failed("connection pool is closed"))
    }
}

#[async_trait]
impl Pool for OrmPool {
    /// The handle is shared, so acquiring only clones it. Custom hook
    /// statements run on whichever session is free.
    async fn acquire(&self, ctx: &Context) -> DbResult<Box<dyn Connection>> {
        let handle = self.handle()?;
        ctx.check("acquire connection").inspect_err(|_| self.metrics.record_canceled())?;
        let started = Instant::now();
        let was_empty = handle.pool.num_idle() == 0;
        self.metrics.record(started, was_empty);

        let mut conn = OrmConnection::new(handle.db.clone(), Arc::clone(&self.hooks), self.query_timeout);
        if let Err(err) = conn.after_acquire_hook(ctx).await {
            warn!(error = %err, "After-acquire hook failed");
        }
        Ok(Box::new(conn))
    }

    fn stats(&self) -> PoolStats {
        let Some(handle) = self.handle.read().clone() else {
            return PoolStats::default();
        };
        let total = handle.pool.size();
        let idle = u32::try_from(handle.pool.num_idle()).unwrap_or(u32::MAX);
        let mut stats = PoolStats {
            acquired_conns: total.saturating_sub(idle),
            idle_conns: idle,
            max_conns: handle.pool.options().get_max_connections(),
            total_conns: total,
            ..PoolStats::default()
        };
        self.metrics.fill(&mut stats);
        stats
    }

    async fn close(&self) {
        let handle = self.handle.write().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.db.clone().close().await {
                warn!(error = %err, "Failed to close database handle");
            }
            handle.pool.close().await;
            info!("Connection pool closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.handle.read().is_none()
    }

    fn driver(&self) -> DriverKind {
        DriverKind::Orm
    }
}

// ========== Provider ==========

pub struct OrmProvider {
    config: Config,
    pool: tokio::sync::RwLock<Option<Arc<OrmPool>>>,
}

impl OrmProvider {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            pool: tokio::sync::RwLock::new(None),
        }
    }
}

#[async_trait]
impl Provider for OrmProvider {
    fn driver(&self) -> DriverKind {
        DriverKind::Orm
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
            .orm_connect_candidates()
            .map_err(|e| connect_error("configured DSN", e.into()))?;
        let pool = open_pool(ctx, &self.config, candidates, DriverKind::Orm).await?;
        *slot = Some(Arc::new(OrmPool::new(pool, &self.config)));
        Ok(())
    }

    async fn close(&self) -> DbResult<()> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(driver = %DriverKind::Orm, "Disconnected from database");
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
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn test_close_without_connect() {
        let provider = OrmProvider::new(Config::default().with_driver(DriverKind::Orm));
        assert_eq!(provider.driver(), DriverKind::Orm);
        assert!(!provider.is_connected().await);
        provider.close().await.unwrap();
        assert!(provider.pool().await.is_none());
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let orm = OrmPool::new(pool, &Config::default());
        assert!(!orm.is_closed());
        orm.close().await;
        assert!(orm.is_closed());
        assert_eq!(orm.stats(), PoolStats::default());

        let err = orm.acquire(&Context::background()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_tenant_hooks_leave_shared_sessions_alone() {
        // nothing listens on port 1: any statement sent would fail
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://app@127.0.0.1:1/unused")
            .unwrap();
        let orm = OrmPool::new(pool, &Config::default().with_multi_tenant(true));
        let ctx = Context::background().with_tenant("tenant-42");

        let mut conn = orm.acquire(&ctx).await.unwrap();
        conn.after_acquire_hook(&ctx).await.unwrap();
        conn.before_release_hook(&ctx).await.unwrap();
        conn.release(&ctx).await;
        assert!(conn.is_released());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_failed() {
        let mut config = Config::default()
            .with_driver(DriverKind::Orm)
            .with_host("127.0.0.1", 1);
        config.timeouts.connect = Duration::from_secs(2);
        config.pool.acquire_timeout = Duration::from_secs(2);
        let provider = OrmProvider::new(config);

        let err = provider.connect(&Context::background()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    }
}
