//! Connections and transactions of the sql backend.
//!
//! sqlx has no multi-result API, so `query_all` is not offered here: use
//! `query` and drain the cursor instead. Batches run one statement at a
//! time, each when its result is read.

use super::params::build_query;
use super::rows::{SqlRows, row_to_record};
use crate::config::DriverKind;
use crate::db::batch::{Batch, EmulatedBatchResults};
use crate::db::context::Context;
use crate::db::hooks::{HookChain, HookExecutor, HookPhase};
use crate::db::nested::NestedTransaction;
use crate::db::row::SingleRow;
use crate::db::traits::{BatchResults, Connection, Queryer, Row, Rows, Transaction};
use crate::error::{DatabaseError, DbResult};
use crate::models::{Record, TxOptions, TxState, Value};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgConnection;
use sqlx::{Column, Executor, Postgres, Statement};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ========== Statement execution ==========

async fn fetch_one(conn: &mut PgConnection, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Record> {
    debug!(sql = %sql, params = args.len(), "Executing single-row query");
    ctx.run("query", async {
        let row = build_query(sql, args).fetch_one(&mut *conn).await?;
        row_to_record(&row)
    })
    .await
}

async fn fetch_optional(
    conn: &mut PgConnection,
    ctx: &Context,
    sql: &str,
    args: &[Value],
) -> DbResult<Option<Record>> {
    debug!(sql = %sql, params = args.len(), "Executing single-row query");
    ctx.run("query", async {
        match build_query(sql, args).fetch_optional(&mut *conn).await? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    })
    .await
}

/// Statements without arguments are sent unprepared, so several
/// statements can run at once.
async fn execute(conn: &mut PgConnection, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64> {
    debug!(sql = %sql, params = args.len(), "Executing statement");
    ctx.run("exec", async {
        let result = if args.is_empty() {
            (&mut *conn).execute(sql).await?
        } else {
            build_query(sql, args).execute(&mut *conn).await?
        };
        Ok(result.rows_affected())
    })
    .await
}

/// Describe the statement for its column names, then stream it.
async fn open_cursor<'a>(
    conn: &'a mut PgConnection,
    ctx: &Context,
    sql: &'a str,
    args: &[Value],
) -> DbResult<SqlRows<'a>> {
    debug!(sql = %sql, params = args.len(), "Opening cursor");
    let columns = ctx
        .run("query", async {
            let statement = (&mut *conn).prepare(sql).await?;
            Ok(statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect::<Vec<_>>())
        })
        .await?;
    let stream = build_query(sql, args).fetch(conn);
    Ok(SqlRows::new(ctx.clone(), stream, columns))
}

fn not_supported() -> DatabaseError {
    DatabaseError::unsupported("query_all is not supported by the sql driver; use query")
}

// ========== Connection ==========

/// A connection checked out of a sqlx pool.
///
/// Dropping it without [`Connection::release`] while release hooks are
/// configured detaches it from the pool and closes it.
pub struct SqlConnection {
    conn: Option<PoolConnection<Postgres>>,
    hooks: Arc<HookChain>,
    query_timeout: Duration,
}

impl SqlConnection {
    pub(crate) fn new(conn: PoolConnection<Postgres>, hooks: Arc<HookChain>, query_timeout: Duration) -> Self {
        Self {
            conn: Some(conn),
            hooks,
            query_timeout,
        }
    }

    fn raw(&mut self) -> DbResult<&mut PgConnection> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(DatabaseError::released()),
        }
    }

    fn query_ctx(&self, ctx: &Context) -> Context {
        ctx.bounded(self.query_timeout)
    }
}

#[async_trait]
impl HookExecutor for SqlConnection {
    async fn execute_hook(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<()> {
        execute(self.raw()?, ctx, sql, args).await.map(|_| ())
    }
}

#[async_trait]
impl Queryer for SqlConnection {
    async fn query_one(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Record> {
        let ctx = self.query_ctx(ctx);
        fetch_one(self.raw()?, &ctx, sql, args).await
    }

    async fn query_all(
        &mut self,
        _ctx: &Context,
        _sql: &str,
        _args: &[Value],
    ) -> DbResult<Vec<Record>> {
        self.raw()?;
        Err(not_supported())
    }

    async fn query<'a>(
        &'a mut self,
        ctx: &Context,
        sql: &'a str,
        args: &[Value],
    ) -> DbResult<Box<dyn Rows + 'a>> {
        let ctx = self.query_ctx(ctx);
        let rows = open_cursor(self.raw()?, &ctx, sql, args).await?;
        Ok(Box::new(rows))
    }

    async fn query_row(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Box<dyn Row>> {
        let ctx = self.query_ctx(ctx);
        let record = fetch_optional(self.raw()?, &ctx, sql, args).await?;
        Ok(Box::new(SingleRow::from_option(record)))
    }

    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64> {
        let ctx = self.query_ctx(ctx);
        execute(self.raw()?, &ctx, sql, args).await
    }

    async fn send_batch<'a>(
        &'a mut self,
        ctx: &Context,
        batch: Batch,
    ) -> DbResult<Box<dyn BatchResults + 'a>> {
        self.raw()?;
        debug!(statements = batch.len(), "Emulating batch");
        Ok(Box::new(EmulatedBatchResults::new(self, ctx, batch)))
    }
}

#[async_trait]
impl Connection for SqlConnection {
    async fn begin_transaction_with_options<'a>(
        &'a mut self,
        ctx: &Context,
        opts: TxOptions,
    ) -> DbResult<Box<dyn Transaction + 'a>> {
        let ctx = self.query_ctx(ctx);
        let query_timeout = self.query_timeout;
        let conn = self.raw()?;

        debug!(options = ?opts, "Beginning transaction");
        let mut tx = ctx
            .run("begin transaction", async {
                sqlx::Connection::begin(conn).await.map_err(DatabaseError::from)
            })
            .await?;
        if let Some(sql) = opts.set_transaction_sql() {
            // the transaction rolls back on drop if this fails
            execute(&mut *tx, &ctx, &sql, &[]).await?;
        }
        Ok(Box::new(SqlTransaction {
            tx: Some(tx),
            state: TxState::Active,
            query_timeout,
        }))
    }

    async fn after_acquire_hook(&mut self, ctx: &Context) -> DbResult<()> {
        self.raw()?;
        let hooks = Arc::clone(&self.hooks);
        hooks.run(ctx, HookPhase::AfterAcquire, self).await
    }

    async fn before_release_hook(&mut self, ctx: &Context) -> DbResult<()> {
        self.raw()?;
        let hooks = Arc::clone(&self.hooks);
        hooks.run(ctx, HookPhase::BeforeRelease, self).await
    }

    async fn release(&mut self, _ctx: &Context) {
        if self.conn.is_none() {
            return;
        }
        let hooks = Arc::clone(&self.hooks);
        let clean = hooks.run_release(self).await;
        if let Some(conn) = self.conn.take() {
            if !clean {
                warn!("Release hooks failed, closing the connection instead of pooling it");
                drop(conn.detach());
            }
        }
        debug!("Connection released");
    }

    async fn ping(&mut self, ctx: &Context) -> DbResult<()> {
        let ctx = self.query_ctx(ctx);
        let conn = self.raw()?;
        ctx.run("ping", async {
            sqlx::Connection::ping(conn).await.map_err(DatabaseError::from)
        })
        .await
    }

    fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    fn driver(&self) -> DriverKind {
        DriverKind::Sql
    }
}

impl Drop for SqlConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.hooks.has_release_steps() {
                warn!("Connection dropped without release, detaching it from the pool");
                drop(conn.detach());
            }
        }
    }
}

// ========== Transaction ==========

pub struct SqlTransaction<'a> {
    tx: Option<sqlx::Transaction<'a, Postgres>>,
    state: TxState,
    query_timeout: Duration,
}

fn inactive(state: TxState) -> DatabaseError {
    DatabaseError::transaction_state(format!("transaction already {state}"))
}

impl<'a> SqlTransaction<'a> {
    fn raw(&mut self) -> DbResult<&mut PgConnection> {
        let state = self.state;
        match self.tx.as_mut() {
            Some(tx) if state == TxState::Active => Ok(&mut **tx),
            _ => Err(inactive(state)),
        }
    }

    fn take_active(&mut self) -> DbResult<sqlx::Transaction<'a, Postgres>> {
        match self.tx.take() {
            Some(tx) if self.state == TxState::Active => Ok(tx),
            _ => Err(inactive(self.state)),
        }
    }
}

#[async_trait]
impl Queryer for SqlTransaction<'_> {
    async fn query_one(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Record> {
        let ctx = ctx.bounded(self.query_timeout);
        fetch_one(self.raw()?, &ctx, sql, args).await
    }

    async fn query_all(
        &mut self,
        _ctx: &Context,
        _sql: &str,
        _args: &[Value],
    ) -> DbResult<Vec<Record>> {
        self.raw()?;
        Err(not_supported())
    }

    async fn query<'b>(
        &'b mut self,
        ctx: &Context,
        sql: &'b str,
        args: &[Value],
    ) -> DbResult<Box<dyn Rows + 'b>> {
        let ctx = ctx.bounded(self.query_timeout);
        let rows = open_cursor(self.raw()?, &ctx, sql, args).await?;
        Ok(Box::new(rows))
    }

    async fn query_row(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Box<dyn Row>> {
        let ctx = ctx.bounded(self.query_timeout);
        let record = fetch_optional(self.raw()?, &ctx, sql, args).await?;
        Ok(Box::new(SingleRow::from_option(record)))
    }

    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64> {
        let ctx = ctx.bounded(self.query_timeout);
        execute(self.raw()?, &ctx, sql, args).await
    }

    async fn send_batch<'b>(
        &'b mut self,
        ctx: &Context,
        batch: Batch,
    ) -> DbResult<Box<dyn BatchResults + 'b>> {
        self.raw()?;
        debug!(statements = batch.len(), "Emulating batch");
        Ok(Box::new(EmulatedBatchResults::new(self, ctx, batch)))
    }
}

#[async_trait]
impl Transaction for SqlTransaction<'_> {
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
