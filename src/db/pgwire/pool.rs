//! deadpool-postgres pool behind the [`Pool`] contract.

use super::WireTls;
use super::connection::WireConnection;
use crate::config::{Config, DriverKind};
use crate::db::context::Context;
use crate::db::hooks::HookChain;
use crate::db::traits::{Connection, Pool};
use crate::error::{DatabaseError, DbResult};
use crate::models::{AcquireMetrics, PoolStats};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct WirePool {
    pool: RwLock<Option<deadpool_postgres::Pool>>,
    hooks: Arc<HookChain>,
    tls: WireTls,
    query_timeout: Duration,
    max_lifetime: Duration,
    max_idle: Duration,
    metrics: AcquireMetrics,
}

impl WirePool {
    pub(crate) fn new(pool: deadpool_postgres::Pool, tls: WireTls, config: &Config) -> Self {
        Self {
            pool: RwLock::new(Some(pool)),
            hooks: Arc::new(HookChain::from_config(config)),
            tls,
            query_timeout: config.timeouts.query,
            max_lifetime: config.pool.max_conn_lifetime,
            max_idle: config.pool.max_conn_idle_time,
            metrics: AcquireMetrics::new(),
        }
    }

    fn handle(&self) -> DbResult<deadpool_postgres::Pool> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| DatabaseError::connection_failed("connection pool is closed"))
    }

    /// deadpool has no lifetime or idle limits of its own; drop idle
    /// clients past either limit before handing one out.
    fn expire_connections(&self, pool: &deadpool_postgres::Pool) {
        let lifetime = self.max_lifetime;
        let idle = self.max_idle;
        let result = pool.retain(|_, metrics| {
            (lifetime.is_zero() || metrics.age() < lifetime)
                && (idle.is_zero() || metrics.last_used() < idle)
        });
        if !result.removed.is_empty() {
            debug!(removed = result.removed.len(), "Expired idle connections");
        }
    }

    /// Check out one client and run a trivial statement on it.
    pub(crate) async fn check(&self, ctx: &Context) -> DbResult<()> {
        let pool = self.handle()?;
        ctx.run("connect", async {
            let client = pool.get().await?;
            client.simple_query("SELECT 1").await?;
            Ok(())
        })
        .await
    }

    /// Open `count` connections so the first callers do not pay for
    /// connection setup.
    pub(crate) async fn prewarm(&self, ctx: &Context, count: usize) -> DbResult<()> {
        let pool = self.handle()?;
        let clients = ctx
            .run("prewarm", async {
                try_join_all((0..count).map(|_| pool.get()))
                    .await
                    .map_err(DatabaseError::from)
            })
            .await?;
        debug!(count = clients.len(), "Pre-warmed connections");
        Ok(())
    }
}

#[async_trait]
impl Pool for WirePool {
    async fn acquire(&self, ctx: &Context) -> DbResult<Box<dyn Connection>> {
        let pool = self.handle()?;
        self.expire_connections(&pool);

        let started = Instant::now();
        let was_empty = pool.status().available == 0;
        let acquired = ctx
            .run("acquire connection", async {
                pool.get().await.map_err(DatabaseError::from)
            })
            .await;
        let client = match acquired {
            Ok(client) => client,
            Err(err) => {
                if ctx.is_done() {
                    self.metrics.record_canceled();
                }
                return Err(err);
            }
        };
        self.metrics.record(started, was_empty);

        let mut conn = WireConnection::new(
            client,
            Arc::clone(&self.hooks),
            self.tls.clone(),
            self.query_timeout,
        );
        if let Err(err) = conn.after_acquire_hook(ctx).await {
            warn!(error = %err, "After-acquire hook failed");
        }
        Ok(Box::new(conn))
    }

    fn stats(&self) -> PoolStats {
        let Some(pool) = self.pool.read().clone() else {
            return PoolStats::default();
        };
        let status = pool.status();
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        let mut stats = PoolStats {
            acquired_conns: count(status.size.saturating_sub(status.available)),
            idle_conns: count(status.available),
            max_conns: count(status.max_size),
            total_conns: count(status.size),
            ..PoolStats::default()
        };
        self.metrics.fill(&mut stats);
        stats
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.write().take() {
            pool.close();
            info!("Connection pool closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.pool.read().is_none()
    }

    fn driver(&self) -> DriverKind {
        DriverKind::Wire
    }
}
