//! Connections and transactions of the wire backend.

use super::WireTls;
use super::params::{as_sql_refs, bind_params};
use super::rows::{WireRows, row_to_record};
use crate::config::DriverKind;
use crate::db::batch::{Batch, PreparedBatchResults, QueuedStatement, StatementOutcome};
use crate::db::context::Context;
use crate::db::hooks::{HookChain, HookExecutor, HookPhase};
use crate::db::nested::NestedTransaction;
use crate::db::row::SingleRow;
use crate::db::traits::{BatchResults, Connection, Queryer, Row, Rows, Transaction};
use crate::error::{DatabaseError, DbResult};
use crate::models::{AccessMode, IsolationLevel, Record, TxOptions, TxState, Value};
use async_trait::async_trait;
use deadpool_postgres::Object;
use futures_util::StreamExt;
use futures_util::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::{Client, GenericClient, RowStream, SimpleQueryMessage};
use tracing::{debug, warn};

// ========== Statement execution ==========

/// Runs statements on a borrowed client. Calls that outlive their context
/// also send a cancel request for the statement in flight.
struct Session<'c> {
    client: &'c Client,
    tls: &'c WireTls,
}

impl Session<'_> {
    async fn guarded<T, F>(&self, ctx: &Context, operation: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        let token = self.client.cancel_token();
        let tls = self.tls.clone();
        ctx.run_abortable(operation, fut, || async move {
            match tls.cancel(&token).await {
                Ok(()) => debug!("Sent cancel request for abandoned statement"),
                Err(err) => warn!(error = %err, "Failed to cancel abandoned statement"),
            }
        })
        .await
    }

    async fn query_all(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Vec<Record>> {
        debug!(sql = %sql, params = args.len(), "Executing query");
        self.guarded(ctx, "query", async {
            let params = bind_params(args);
            let rows = self.client.query(sql, &as_sql_refs(&params)).await?;
            rows.iter().map(row_to_record).collect()
        })
        .await
    }

    async fn first(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Option<Record>> {
        debug!(sql = %sql, params = args.len(), "Executing single-row query");
        self.guarded(ctx, "query", async {
            let params = bind_params(args);
            let mut stream = Box::pin(self.client.query_raw(sql, as_sql_refs(&params)).await?);
            match stream.next().await {
                Some(row) => Ok(Some(row_to_record(&row?)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn open_stream(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<(RowStream, Vec<String>)> {
        debug!(sql = %sql, params = args.len(), "Opening cursor");
        self.guarded(ctx, "query", async {
            let statement = self.client.prepare(sql).await?;
            let columns = statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            let params = bind_params(args);
            let stream = self.client.query_raw(&statement, as_sql_refs(&params)).await?;
            Ok((stream, columns))
        })
        .await
    }

    /// Statements without arguments go through the simple protocol, so
    /// several statements can be sent at once.
    async fn exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64> {
        debug!(sql = %sql, params = args.len(), "Executing statement");
        self.guarded(ctx, "exec", async {
            if args.is_empty() {
                let messages = self.client.simple_query(sql).await?;
                Ok(messages
                    .iter()
                    .filter_map(|m| match m {
                        SimpleQueryMessage::CommandComplete(n) => Some(*n),
                        _ => None,
                    })
                    .last()
                    .unwrap_or(0))
            } else {
                let params = bind_params(args);
                Ok(self.client.execute(sql, &as_sql_refs(&params)).await?)
            }
        })
        .await
    }

    /// Send every statement before reading any result. The client pipelines
    /// requests issued concurrently on one connection.
    async fn batch(&self, ctx: &Context, batch: Batch) -> DbResult<PreparedBatchResults> {
        let statements = batch.into_statements();
        debug!(statements = statements.len(), "Pipelining batch");
        let outcomes = self
            .guarded(ctx, "batch", async {
                Ok(join_all(statements.iter().map(|stmt| self.pipelined(stmt))).await)
            })
            .await?;
        Ok(PreparedBatchResults::new(outcomes))
    }

    async fn pipelined(&self, stmt: &QueuedStatement) -> DbResult<StatementOutcome> {
        let params = bind_params(&stmt.args);
        let mut stream = Box::pin(self.client.query_raw(stmt.sql.as_str(), as_sql_refs(&params)).await?);
        let mut records = Vec::new();
        while let Some(row) = stream.next().await {
            records.push(row_to_record(&row?)?);
        }
        let rows_affected = stream
            .rows_affected()
            .unwrap_or(records.len() as u64);
        Ok(StatementOutcome {
            records,
            rows_affected,
        })
    }
}

fn isolation(level: IsolationLevel) -> tokio_postgres::IsolationLevel {
    match level {
        IsolationLevel::ReadUncommitted => tokio_postgres::IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted => tokio_postgres::IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead => tokio_postgres::IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable => tokio_postgres::IsolationLevel::Serializable,
    }
}

// ========== Connection ==========

/// A pooled tokio-postgres client.
///
/// Dropping it without [`Connection::release`] while release hooks are
/// configured detaches the client from the pool, so a tenant setting can
/// never reach the next borrower.
pub struct WireConnection {
    client: Option<Object>,
    hooks: Arc<HookChain>,
    tls: WireTls,
    query_timeout: Duration,
}

impl WireConnection {
    pub(crate) fn new(
        client: Object,
        hooks: Arc<HookChain>,
        tls: WireTls,
        query_timeout: Duration,
    ) -> Self {
        Self {
            client: Some(client),
            hooks,
            tls,
            query_timeout,
        }
    }

    fn session(&self) -> DbResult<Session<'_>> {
        let client: &Client = self.client.as_ref().ok_or_else(DatabaseError::released)?;
        Ok(Session {
            client,
            tls: &self.tls,
        })
    }

    fn query_ctx(&self, ctx: &Context) -> Context {
        ctx.bounded(self.query_timeout)
    }
}

#[async_trait]
impl HookExecutor for WireConnection {
    async fn execute_hook(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<()> {
        self.session()?.exec(ctx, sql, args).await.map(|_| ())
    }
}

#[async_trait]
impl Queryer for WireConnection {
    async fn query_one(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Record> {
        let ctx = self.query_ctx(ctx);
        self.session()?
            .first(&ctx, sql, args)
            .await?
            .ok_or_else(|| DatabaseError::not_found("no rows in result set"))
    }

    async fn query_all(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Vec<Record>> {
        let ctx = self.query_ctx(ctx);
        self.session()?.query_all(&ctx, sql, args).await
    }

    async fn query<'a>(
        &'a mut self,
        ctx: &Context,
        sql: &'a str,
        args: &[Value],
    ) -> DbResult<Box<dyn Rows + 'a>> {
        let ctx = self.query_ctx(ctx);
        let (stream, columns) = self.session()?.open_stream(&ctx, sql, args).await?;
        Ok(Box::new(WireRows::new(ctx, stream, columns)))
    }

    async fn query_row(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Box<dyn Row>> {
        let ctx = self.query_ctx(ctx);
        let record = self.session()?.first(&ctx, sql, args).await?;
        Ok(Box::new(SingleRow::from_option(record)))
    }

    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64> {
        let ctx = self.query_ctx(ctx);
        self.session()?.exec(&ctx, sql, args).await
    }

    async fn send_batch<'a>(
        &'a mut self,
        ctx: &Context,
        batch: Batch,
    ) -> DbResult<Box<dyn BatchResults + 'a>> {
        let ctx = self.query_ctx(ctx);
        let results = self.session()?.batch(&ctx, batch).await?;
        Ok(Box::new(results))
    }
}

#[async_trait]
impl Connection for WireConnection {
    async fn begin_transaction_with_options<'a>(
        &'a mut self,
        ctx: &Context,
        opts: TxOptions,
    ) -> DbResult<Box<dyn Transaction + 'a>> {
        let ctx = self.query_ctx(ctx);
        let tls = self.tls.clone();
        let query_timeout = self.query_timeout;
        let object = self.client.as_mut().ok_or_else(DatabaseError::released)?;
        let client: &mut Client = object;

        let mut builder = client.build_transaction();
        if let Some(level) = opts.isolation {
            builder = builder.isolation_level(isolation(level));
        }
        match opts.access_mode {
            Some(AccessMode::ReadOnly) => builder = builder.read_only(true),
            Some(AccessMode::ReadWrite) => builder = builder.read_only(false),
            None => {}
        }
        if opts.deferrable {
            builder = builder.deferrable(true);
        }

        debug!(options = ?opts, "Beginning transaction");
        let tx = ctx
            .run("begin transaction", async {
                builder.start().await.map_err(DatabaseError::from)
            })
            .await?;
        Ok(Box::new(WireTransaction {
            tx: Some(tx),
            state: TxState::Active,
            tls,
            query_timeout,
        }))
    }

    async fn after_acquire_hook(&mut self, ctx: &Context) -> DbResult<()> {
        if self.client.is_none() {
            return Err(DatabaseError::released());
        }
        let hooks = Arc::clone(&self.hooks);
        hooks.run(ctx, HookPhase::AfterAcquire, self).await
    }

    async fn before_release_hook(&mut self, ctx: &Context) -> DbResult<()> {
        if self.client.is_none() {
            return Err(DatabaseError::released());
        }
        let hooks = Arc::clone(&self.hooks);
        hooks.run(ctx, HookPhase::BeforeRelease, self).await
    }

    async fn release(&mut self, _ctx: &Context) {
        if self.client.is_none() {
            return;
        }
        let hooks = Arc::clone(&self.hooks);
        let clean = hooks.run_release(self).await;
        // dropping the object hands the client back to the pool
        if let Some(object) = self.client.take() {
            if !clean {
                warn!("Release hooks failed, closing the connection instead of pooling it");
                drop(Object::take(object));
            }
        }
        debug!("Connection released");
    }

    async fn ping(&mut self, ctx: &Context) -> DbResult<()> {
        let ctx = self.query_ctx(ctx);
        self.session()?.exec(&ctx, "SELECT 1", &[]).await.map(|_| ())
    }

    fn is_released(&self) -> bool {
        self.client.is_none()
    }

    fn driver(&self) -> DriverKind {
        DriverKind::Wire
    }
}

impl Drop for WireConnection {
    fn drop(&mut self) {
        if let Some(object) = self.client.take() {
            if self.hooks.has_release_steps() {
                warn!("Connection dropped without release, detaching it from the pool");
                drop(Object::take(object));
            }
        }
    }
}

// ========== Transaction ==========

pub struct WireTransaction<'a> {
    tx: Option<tokio_postgres::Transaction<'a>>,
    state: TxState,
    tls: WireTls,
    query_timeout: Duration,
}

impl<'a> WireTransaction<'a> {
    fn session(&self) -> DbResult<Session<'_>> {
        match &self.tx {
            Some(tx) if self.state == TxState::Active => Ok(Session {
                client: GenericClient::client(tx),
                tls: &self.tls,
            }),
            _ => Err(DatabaseError::transaction_state(format!(
                "transaction already {}",
                self.state
            ))),
        }
    }

    fn take_active(&mut self) -> DbResult<tokio_postgres::Transaction<'a>> {
        match self.tx.take() {
            Some(tx) if self.state == TxState::Active => Ok(tx),
            _ => Err(DatabaseError::transaction_state(format!(
                "transaction already {}",
                self.state
            ))),
        }
    }
}

#[async_trait]
impl Queryer for WireTransaction<'_> {
    async fn query_one(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Record> {
        let ctx = ctx.bounded(self.query_timeout);
        self.session()?
            .first(&ctx, sql, args)
            .await?
            .ok_or_else(|| DatabaseError::not_found("no rows in result set"))
    }

    async fn query_all(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Vec<Record>> {
        let ctx = ctx.bounded(self.query_timeout);
        self.session()?.query_all(&ctx, sql, args).await
    }

    async fn query<'b>(
        &'b mut self,
        ctx: &Context,
        sql: &'b str,
        args: &[Value],
    ) -> DbResult<Box<dyn Rows + 'b>> {
        let ctx = ctx.bounded(self.query_timeout);
        let (stream, columns) = self.session()?.open_stream(&ctx, sql, args).await?;
        Ok(Box::new(WireRows::new(ctx, stream, columns)))
    }

    async fn query_row(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Box<dyn Row>> {
        let ctx = ctx.bounded(self.query_timeout);
        let record = self.session()?.first(&ctx, sql, args).await?;
        Ok(Box::new(SingleRow::from_option(record)))
    }

    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64> {
        let ctx = ctx.bounded(self.query_timeout);
        self.session()?.exec(&ctx, sql, args).await
    }

    async fn send_batch<'b>(
        &'b mut self,
        ctx: &Context,
        batch: Batch,
    ) -> DbResult<Box<dyn BatchResults + 'b>> {
        let ctx = ctx.bounded(self.query_timeout);
        let results = self.session()?.batch(&ctx, batch).await?;
        Ok(Box::new(results))
    }
}

#[async_trait]
impl Transaction for WireTransaction<'_> {
    async fn commit(&mut self, ctx: &Context) -> DbResult<()> {
        let ctx = ctx.bounded(self.query_timeout);
        let tx = self.take_active()?;
        let result = ctx
            .run("commit", async { tx.commit().await.map_err(DatabaseError::from) })
            .await;
        self.state = if result.is_ok() {
            TxState::Committed
        } else {
            TxState::RolledBack
        };
        debug!(state = %self.state, "Transaction finished");
        result
    }

    async fn rollback(&mut self, ctx: &Context) -> DbResult<()> {
        let ctx = ctx.bounded(self.query_timeout);
        let tx = self.take_active()?;
        self.state = TxState::RolledBack;
        debug!("Rolling back transaction");
        ctx.run("rollback", async {
            tx.rollback().await.map_err(DatabaseError::from)
        })
        .await
    }

    async fn begin_nested_transaction<'b>(
        &'b mut self,
        ctx: &Context,
    ) -> DbResult<Box<dyn Transaction + 'b>> {
        Ok(Box::new(NestedTransaction::begin(self, ctx).await?))
    }

    fn state(&self) -> TxState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorKind;

    impl WireConnection {
        /// A connection whose client was already handed back.
        fn detached(hooks: HookChain) -> Self {
            Self {
                client: None,
                hooks: Arc::new(hooks),
                tls: WireTls::Plain(tokio_postgres::NoTls),
                query_timeout: Duration::from_secs(1),
            }
        }
    }

    #[tokio::test]
    async fn test_released_connection_rejects_operations() {
        let ctx = Context::background();
        let mut conn = WireConnection::detached(HookChain::default());
        assert!(conn.is_released());
        assert_eq!(conn.driver(), DriverKind::Wire);

        let err = conn.query_one(&ctx, "SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReleased);
        let err = conn.exec(&ctx, "SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReleased);
        let err = conn.begin_transaction(&ctx).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionReleased);
        let err = conn.ping(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReleased);
        let err = conn.after_acquire_hook(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReleased);
        let err = conn.send_batch(&ctx, Batch::new()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionReleased);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let ctx = Context::background();
        let hooks = HookChain::from_config(&Config::default().with_multi_tenant(true));
        let mut conn = WireConnection::detached(hooks);
        conn.release(&ctx).await;
        conn.release(&ctx).await;
        assert!(conn.is_released());
    }

    #[test]
    fn test_isolation_mapping() {
        assert!(matches!(
            isolation(IsolationLevel::Serializable),
            tokio_postgres::IsolationLevel::Serializable
        ));
        assert!(matches!(
            isolation(IsolationLevel::ReadCommitted),
            tokio_postgres::IsolationLevel::ReadCommitted
        ));
    }
}
