//! The driver-agnostic contract.
//!
//! Every backend implements [`Provider`], [`Pool`], [`Connection`],
//! [`Transaction`] and the cursor traits. Capabilities a backend lacks are
//! reported with `Unsupported` / `BatchUnsupported` errors instead of being
//! emulated silently.

use crate::config::{Config, DriverKind};
use crate::db::batch::Batch;
use crate::db::context::Context;
use crate::db::row::SingleRow;
use crate::error::{DatabaseError, DbResult};
use crate::models::{PoolStats, Record, TxOptions, TxState, Value};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

/// A single row that can be scanned once.
pub trait Row: Send {
    /// Take the row. Fails with `RecordNotFound` when the query returned no
    /// row and with `InvalidData` when the row was already scanned.
    fn scan(&mut self) -> DbResult<Record>;
}

/// Streaming cursor over a result set.
#[async_trait]
pub trait Rows: Send {
    /// Advance to the next row. Returns false once the cursor is exhausted,
    /// closed or failed; check [`Rows::err`] afterwards.
    async fn next(&mut self) -> bool;

    /// Decode the current row.
    fn scan(&self) -> DbResult<Record>;

    fn columns(&self) -> &[String];

    /// Wire bytes of each column of the current row (`None` for SQL NULL).
    /// Returns `None` when there is no current row.
    fn raw_values(&self) -> Option<Vec<Option<&[u8]>>>;

    /// Stop reading. Idempotent.
    async fn close(&mut self);

    /// The error that ended iteration, if any.
    fn err(&self) -> Option<&DatabaseError>;

    /// Take the error that ended iteration, if any.
    fn take_err(&mut self) -> Option<DatabaseError>;
}

/// Results of a [`Batch`], read back in the order the statements were queued.
#[async_trait]
pub trait BatchResults: Send {
    /// Rows affected by the next statement.
    async fn exec(&mut self) -> DbResult<u64>;

    /// All rows of the next statement.
    async fn query(&mut self) -> DbResult<Vec<Record>>;

    /// First row of the next statement; `RecordNotFound` when it has none.
    async fn query_row(&mut self) -> DbResult<Record>;

    /// Discard unread results.
    async fn close(&mut self) -> DbResult<()>;
}

/// Query surface shared by connections and transactions.
#[async_trait]
pub trait Queryer: Send {
    /// First row of the result; zero rows fail with `RecordNotFound`.
    async fn query_one(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Record>;

    /// Every row of the result.
    async fn query_all(&mut self, ctx: &Context, sql: &str, args: &[Value])
    -> DbResult<Vec<Record>>;

    /// Streaming cursor.
    async fn query<'a>(
        &'a mut self,
        ctx: &Context,
        sql: &'a str,
        args: &[Value],
    ) -> DbResult<Box<dyn Rows + 'a>>;

    /// First row, scanned later.
    async fn query_row(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Box<dyn Row>>;

    /// Drain a cursor into single rows.
    async fn query_rows(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Vec<Box<dyn Row>>> {
        let rows = self.query(ctx, sql, args).await?;
        let records = crate::db::row::collect_rows(rows).await?;
        Ok(records
            .into_iter()
            .map(|r| Box::new(SingleRow::new(r)) as Box<dyn Row>)
            .collect())
    }

    /// Run a statement and return the number of rows affected.
    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64>;

    async fn send_batch<'a>(
        &'a mut self,
        ctx: &Context,
        batch: Batch,
    ) -> DbResult<Box<dyn BatchResults + 'a>>;
}

/// Typed helpers over any [`Queryer`], decoding rows through serde.
#[async_trait]
pub trait QueryerExt: Queryer {
    async fn query_one_as<T>(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<T>
    where
        T: DeserializeOwned + Send,
    {
        self.query_one(ctx, sql, args).await?.decode()
    }

    async fn query_all_as<T>(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.query_all(ctx, sql, args)
            .await?
            .iter()
            .map(Record::decode)
            .collect()
    }
}

impl<Q: Queryer + ?Sized> QueryerExt for Q {}

/// One session checked out of a [`Pool`].
///
/// Every operation after [`Connection::release`] fails with
/// `ConnectionReleased`.
#[async_trait]
pub trait Connection: Queryer {
    async fn begin_transaction<'a>(
        &'a mut self,
        ctx: &Context,
    ) -> DbResult<Box<dyn Transaction + 'a>> {
        self.begin_transaction_with_options(ctx, TxOptions::default())
            .await
    }

    async fn begin_transaction_with_options<'a>(
        &'a mut self,
        ctx: &Context,
        opts: TxOptions,
    ) -> DbResult<Box<dyn Transaction + 'a>>;

    /// Run the after-acquire hooks. Pools call this on acquire and only log
    /// failures; direct callers get the first hook error.
    async fn after_acquire_hook(&mut self, ctx: &Context) -> DbResult<()>;

    /// Run the before-release hooks.
    async fn before_release_hook(&mut self, ctx: &Context) -> DbResult<()>;

    /// Run the before-release hooks, then hand the session back to the pool.
    /// The hooks run on a fresh context, so a cancelled caller still resets
    /// the session; when one fails the session is closed instead of pooled.
    /// Idempotent; hook failures are logged, never returned.
    async fn release(&mut self, ctx: &Context);

    async fn ping(&mut self, ctx: &Context) -> DbResult<()>;

    fn is_released(&self) -> bool;

    fn driver(&self) -> DriverKind;
}

/// A database transaction.
///
/// `Active → Committed | RolledBack`; once terminal every call fails with
/// `InvalidTransactionState`. Dropping an active transaction rolls it back.
#[async_trait]
pub trait Transaction: Queryer {
    async fn commit(&mut self, ctx: &Context) -> DbResult<()>;

    async fn rollback(&mut self, ctx: &Context) -> DbResult<()>;

    async fn savepoint(&mut self, ctx: &Context, name: &str) -> DbResult<()> {
        let name = crate::db::validate_savepoint_name(name)?;
        self.exec(ctx, &format!("SAVEPOINT {name}"), &[]).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, ctx: &Context, name: &str) -> DbResult<()> {
        let name = crate::db::validate_savepoint_name(name)?;
        self.exec(ctx, &format!("ROLLBACK TO SAVEPOINT {name}"), &[])
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, ctx: &Context, name: &str) -> DbResult<()> {
        let name = crate::db::validate_savepoint_name(name)?;
        self.exec(ctx, &format!("RELEASE SAVEPOINT {name}"), &[])
            .await?;
        Ok(())
    }

    /// Start a nested transaction. This is a savepoint with a generated
    /// name, not an independent transaction: committing it releases the
    /// savepoint, rolling it back returns to it.
    async fn begin_nested_transaction<'a>(
        &'a mut self,
        ctx: &Context,
    ) -> DbResult<Box<dyn Transaction + 'a>>;

    fn state(&self) -> TxState;
}

/// Source of connections.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Check out a connection and run its after-acquire hooks.
    async fn acquire(&self, ctx: &Context) -> DbResult<Box<dyn Connection>>;

    async fn acquire_with_timeout(
        &self,
        ctx: &Context,
        timeout: Duration,
    ) -> DbResult<Box<dyn Connection>> {
        self.acquire(&ctx.with_timeout(timeout)).await
    }

    /// Normalized snapshot; all zero when the native handle is gone.
    fn stats(&self) -> PoolStats;

    /// Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn driver(&self) -> DriverKind;
}

/// Lifecycle owner of one backend's native handle.
#[async_trait]
pub trait Provider: Send + Sync {
    fn driver(&self) -> DriverKind;

    fn config(&self) -> &Config;

    /// Open the native handle and check it is alive. A no-op when connected.
    async fn connect(&self, ctx: &Context) -> DbResult<()>;

    /// Release the native handle. Idempotent, safe without `connect`.
    async fn close(&self) -> DbResult<()>;

    /// The pool, when connected.
    async fn pool(&self) -> Option<Arc<dyn Pool>>;

    async fn is_connected(&self) -> bool;
}

/// A connection that is either borrowed from the caller or owned.
pub enum ConnHandle<'a> {
    Borrowed(&'a mut (dyn Connection + 'static)),
    Owned(Box<dyn Connection>),
}

impl ConnHandle<'_> {
    pub fn is_borrowed(&self) -> bool {
        matches!(self, Self::Borrowed(_))
    }

    /// Release an owned connection; a borrowed one stays with its owner.
    pub async fn release(self, ctx: &Context) {
        if let Self::Owned(mut conn) = self {
            conn.release(ctx).await;
        }
    }
}

impl Deref for ConnHandle<'_> {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Borrowed(conn) => &**conn,
            Self::Owned(conn) => conn.as_ref(),
        }
    }
}

impl DerefMut for ConnHandle<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Borrowed(conn) => &mut **conn,
            Self::Owned(conn) => conn.as_mut(),
        }
    }
}

/// Reuse `existing` when present, otherwise acquire a new connection from
/// `pool`. Nested call sites can share one connection without branching.
pub async fn get_conn_with_not_present<'a>(
    pool: &dyn Pool,
    ctx: &Context,
    existing: Option<&'a mut (dyn Connection + 'static)>,
) -> DbResult<ConnHandle<'a>> {
    match existing {
        Some(conn) => Ok(ConnHandle::Borrowed(conn)),
        None => pool.acquire(ctx).await.map(ConnHandle::Owned),
    }
}
