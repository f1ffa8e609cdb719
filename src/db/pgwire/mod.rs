//! Wire backend: tokio-postgres clients pooled by deadpool-postgres.
//!
//! This is the full-featured backend. Batches are pipelined on one
//! connection, cursors stream rows as they arrive, and a statement that
//! outlives its context is cancelled on the server as well.

pub mod connection;
mod params;
pub mod pool;
pub mod rows;

pub use connection::{WireConnection, WireTransaction};
pub use pool::WirePool;

use crate::config::{Config, DEFAULT_HOST, DEFAULT_PORT, DriverKind, DsnParts, SslMode};
use crate::db::connect_error;
use crate::db::context::Context;
use crate::db::traits::{Pool, Provider};
use crate::error::{DatabaseError, DbResult, ErrorKind};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, RecyclingMethod, Runtime};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_postgres::CancelToken;
use tracing::{info, warn};

// ========== TLS ==========

/// TLS connector shared by the pool and by cancel requests.
#[derive(Clone)]
pub enum WireTls {
    Plain(tokio_postgres::NoTls),
    #[cfg(feature = "tls-native")]
    Native(postgres_native_tls::MakeTlsConnector),
}

impl WireTls {
    /// Connector for `mode`. Modes that need TLS fail without the
    /// `tls-native` feature.
    #[cfg(not(feature = "tls-native"))]
    pub(crate) fn for_mode(mode: SslMode) -> DbResult<Self> {
        match mode {
            SslMode::Disable | SslMode::Allow | SslMode::Prefer => {
                Ok(Self::Plain(tokio_postgres::NoTls))
            }
            _ => Err(DatabaseError::configuration(format!(
                "ssl_mode: sslmode={mode} requires the tls-native feature"
            ))),
        }
    }

    #[cfg(feature = "tls-native")]
    pub(crate) fn for_mode(mode: SslMode) -> DbResult<Self> {
        if mode == SslMode::Disable {
            return Ok(Self::Plain(tokio_postgres::NoTls));
        }
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(!matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull))
            .danger_accept_invalid_hostnames(mode != SslMode::VerifyFull)
            .build()
            .map_err(|e| {
                DatabaseError::with_source(
                    ErrorKind::Configuration,
                    format!("failed to build TLS connector: {e}"),
                    e,
                )
            })?;
        Ok(Self::Native(postgres_native_tls::MakeTlsConnector::new(
            connector,
        )))
    }

    pub(crate) async fn cancel(&self, token: &CancelToken) -> Result<(), tokio_postgres::Error> {
        match self {
            Self::Plain(tls) => token.cancel_query(*tls).await,
            #[cfg(feature = "tls-native")]
            Self::Native(tls) => token.cancel_query(tls.clone()).await,
        }
    }

    fn manager(&self, pg: tokio_postgres::Config, config: ManagerConfig) -> Manager {
        match self {
            Self::Plain(tls) => Manager::from_config(pg, *tls, config),
            #[cfg(feature = "tls-native")]
            Self::Native(tls) => Manager::from_config(pg, tls.clone(), config),
        }
    }
}

// ========== Native options ==========

fn pg_ssl_mode(mode: SslMode) -> tokio_postgres::config::SslMode {
    use tokio_postgres::config::SslMode as Pg;
    match mode {
        SslMode::Disable => Pg::Disable,
        SslMode::Allow | SslMode::Prefer => Pg::Prefer,
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => Pg::Require,
    }
}

/// tokio-postgres options for one candidate host. Parameters the client
/// has no setter for travel in the startup `options`.
pub(crate) fn pg_config(parts: &DsnParts, ssl_mode: SslMode) -> tokio_postgres::Config {
    let mut pg = tokio_postgres::Config::new();
    pg.host(parts.host.as_deref().unwrap_or(DEFAULT_HOST));
    pg.port(parts.port.unwrap_or(DEFAULT_PORT));
    if let Some(user) = &parts.user {
        pg.user(user);
    }
    if let Some(password) = &parts.password {
        pg.password(password);
    }
    if let Some(dbname) = &parts.dbname {
        pg.dbname(dbname);
    }
    if let Some(name) = &parts.application_name {
        pg.application_name(name);
    }
    if let Some(timeout) = parts.connect_timeout {
        pg.connect_timeout(timeout);
    }
    if let Some(options) = parts.options_string() {
        pg.options(&options);
    }
    pg.ssl_mode(pg_ssl_mode(ssl_mode));
    pg
}

fn build_pool(
    config: &Config,
    parts: &DsnParts,
    ssl_mode: SslMode,
    tls: &WireTls,
) -> DbResult<deadpool_postgres::Pool> {
    let recycling_method = if config.pool.test_before_acquire {
        RecyclingMethod::Verified
    } else {
        RecyclingMethod::Fast
    };
    let manager = tls.manager(pg_config(parts, ssl_mode), ManagerConfig { recycling_method });
    let connect_timeout = Some(config.timeouts.connect).filter(|d| !d.is_zero());
    deadpool_postgres::Pool::builder(manager)
        .max_size(config.pool.max_connections as usize)
        .runtime(Runtime::Tokio1)
        .wait_timeout(Some(config.pool.acquire_timeout).filter(|d| !d.is_zero()))
        .create_timeout(connect_timeout)
        .recycle_timeout(connect_timeout)
        .build()
        .map_err(|e| {
            DatabaseError::with_source(
                ErrorKind::Configuration,
                format!("failed to build connection pool: {e}"),
                e,
            )
        })
}

// ========== Provider ==========

pub struct WireProvider {
    config: Config,
    pool: RwLock<Option<Arc<WirePool>>>,
}

impl WireProvider {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
        }
    }

    /// Build a pool for one candidate and prove it can reach the server.
    async fn open(&self, ctx: &Context, parts: &DsnParts) -> DbResult<Arc<WirePool>> {
        let ssl_mode = parts.ssl_mode.unwrap_or(self.config.ssl_mode);
        let tls = WireTls::for_mode(ssl_mode)?;
        let native = build_pool(&self.config, parts, ssl_mode, &tls)?;
        let pool = Arc::new(WirePool::new(native, tls, &self.config));

        let check_ctx = ctx.bounded(self.config.timeouts.connect);
        if let Err(err) = pool.check(&check_ctx).await {
            pool.close().await;
            return Err(err);
        }

        let min = self.config.pool.min_connections as usize;
        if min > 1 {
            if let Err(err) = pool.prewarm(&check_ctx, min).await {
                warn!(error = %err, "Failed to pre-warm connections");
            }
        }
        Ok(pool)
    }
}

#[async_trait]
impl Provider for WireProvider {
    fn driver(&self) -> DriverKind {
        DriverKind::Wire
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

        let mut last_err = None;
        for parts in &candidates {
            let target = format!(
                "{}:{}",
                parts.host.as_deref().unwrap_or(DEFAULT_HOST),
                parts.port.unwrap_or(DEFAULT_PORT)
            );
            match self.open(ctx, parts).await {
                Ok(pool) => {
                    info!(
                        driver = %DriverKind::Wire,
                        target = %target,
                        max_connections = self.config.pool.max_connections,
                        "Connected to database"
                    );
                    *slot = Some(pool);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Configuration => return Err(err),
                Err(err) => {
                    warn!(target = %target, error = %err, "Connection attempt failed");
                    last_err = Some(connect_error(&target, err));
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| DatabaseError::connection_failed("no connection candidates")))
    }

    async fn close(&self) -> DbResult<()> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(driver = %DriverKind::Wire, "Disconnected from database");
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
