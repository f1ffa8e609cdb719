//! Connections and transactions of the orm backend.
//!
//! A sea-orm `DatabaseConnection` multiplexes statements over its own pool,
//! so an `OrmConnection` is a clone of that handle rather than a pinned
//! session. Cursors, deferred single rows and batches are not available.

use crate::config::DriverKind;
use crate::db::batch::Batch;
use crate::db::context::Context;
use crate::db::hooks::{HookChain, HookExecutor, HookPhase, SET_LOCAL_CONFIG_SQL};
use crate::db::nested::NestedTransaction;
use crate::db::traits::{BatchResults, Connection, Queryer, Row, Rows, Transaction};
use crate::db::types::json_to_value;
use crate::error::{DatabaseError, DbResult};
use crate::models::{AccessMode, IsolationLevel, Record, TxOptions, TxState, Value};
use async_trait::async_trait;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, FromQueryResult,
    JsonValue, Statement, TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// ========== Statement execution ==========

fn to_orm_value(value: &Value) -> sea_orm::Value {
    match value {
        // sea-query has no untyped NULL
        Value::Null => sea_orm::Value::String(None),
        Value::Bool(v) => (*v).into(),
        Value::Int(v) => (*v).into(),
        Value::Float(v) => (*v).into(),
        Value::Text(v) => v.clone().into(),
        Value::Bytes(v) => v.clone().into(),
        Value::Json(v) => v.clone().into(),
        Value::Timestamp(v) => (*v).into(),
        Value::Uuid(v) => (*v).into(),
    }
}

fn statement(sql: &str, args: &[Value]) -> Statement {
    if args.is_empty() {
        Statement::from_string(DbBackend::Postgres, sql)
    } else {
        Statement::from_sql_and_values(DbBackend::Postgres, sql, args.iter().map(to_orm_value))
    }
}

/// Rows arrive as JSON objects whose key order follows the select list.
fn json_to_record(json: JsonValue) -> DbResult<Record> {
    match json {
        JsonValue::Object(map) => {
            let (columns, values) = map
                .into_iter()
                .map(|(column, cell)| (column, json_to_value(cell)))
                .unzip();
            Ok(Record::new(columns, values))
        }
        other => Err(DatabaseError::invalid_data(format!(
            "expected a row object, got {other}"
        ))),
    }
}

async fn fetch_one<C: ConnectionTrait>(db: &C, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Record> {
    debug!(sql = %sql, params = args.len(), "Executing single-row query");
    ctx.run("query", async {
        let row = JsonValue::find_by_statement(statement(sql, args))
            .one(db)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound("no rows in result set".to_string()))?;
        json_to_record(row)
    })
    .await
}

async fn fetch_all<C: ConnectionTrait>(
    db: &C,
    ctx: &Context,
    sql: &str,
    args: &[Value],
) -> DbResult<Vec<Record>> {
    debug!(sql = %sql, params = args.len(), "Executing query");
    ctx.run("query", async {
        JsonValue::find_by_statement(statement(sql, args))
            .all(db)
            .await?
            .into_iter()
            .map(json_to_record)
            .collect()
    })
    .await
}

/// Statements without arguments are sent unprepared, so several
/// statements can run at once.
async fn execute<C: ConnectionTrait>(db: &C, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64> {
    debug!(sql = %sql, params = args.len(), "Executing statement");
    ctx.run("exec", async {
        let result = if args.is_empty() {
            db.execute_unprepared(sql).await?
        } else {
            db.execute(statement(sql, args)).await?
        };
        Ok(result.rows_affected())
    })
    .await
}

fn cursor_unsupported(operation: &str) -> DatabaseError {
    DatabaseError::unsupported(format!(
        "{operation} is not supported by the orm driver; use query_one or query_all"
    ))
}

fn isolation(level: IsolationLevel) -> sea_orm::IsolationLevel {
    match level {
        IsolationLevel::ReadUncommitted => sea_orm::IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted => sea_orm::IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead => sea_orm::IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable => sea_orm::IsolationLevel::Serializable,
    }
}

fn access_mode(mode: AccessMode) -> sea_orm::AccessMode {
    match mode {
        AccessMode::ReadOnly => sea_orm::AccessMode::ReadOnly,
        AccessMode::ReadWrite => sea_orm::AccessMode::ReadWrite,
    }
}

// ========== Connection ==========

pub struct OrmConnection {
    db: Option<DatabaseConnection>,
    hooks: Arc<HookChain>,
    query_timeout: Duration,
}

impl OrmConnection {
    pub(crate) fn new(db: DatabaseConnection, hooks: Arc<HookChain>, query_timeout: Duration) -> Self {
        Self {
            db: Some(db),
            hooks,
            query_timeout,
        }
    }

    fn handle(&self) -> DbResult<&DatabaseConnection> {
        self.db.as_ref().ok_or_else(DatabaseError::released)
    }

    fn query_ctx(&self, ctx: &Context) -> Context {
        ctx.bounded(self.query_timeout)
    }
}

#[async_trait]
impl HookExecutor for OrmConnection {
    async fn execute_hook(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<()> {
        execute(self.handle()?, ctx, sql, args).await.map(|_| ())
    }
}

#[async_trait]
impl Queryer for OrmConnection {
    async fn query_one(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Record> {
        let ctx = self.query_ctx(ctx);
        fetch_one(self.handle()?, &ctx, sql, args).await
    }

    async fn query_all(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Vec<Record>> {
        let ctx = self.query_ctx(ctx);
        fetch_all(self.handle()?, &ctx, sql, args).await
    }

    async fn query<'a>(
        &'a mut self,
        _ctx: &Context,
        _sql: &'a str,
        _args: &[Value],
    ) -> DbResult<Box<dyn Rows + 'a>> {
        self.handle()?;
        Err(cursor_unsupported("query"))
    }

    async fn query_row(
        &mut self,
        _ctx: &Context,
        _sql: &str,
        _args: &[Value],
    ) -> DbResult<Box<dyn Row>> {
        self.handle()?;
        Err(cursor_unsupported("query_row"))
    }

    async fn query_rows(
        &mut self,
        _ctx: &Context,
        _sql: &str,
        _args: &[Value],
    ) -> DbResult<Vec<Box<dyn Row>>> {
        self.handle()?;
        Err(cursor_unsupported("query_rows"))
    }

    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64> {
        let ctx = self.query_ctx(ctx);
        execute(self.handle()?, &ctx, sql, args).await
    }

    async fn send_batch<'a>(
        &'a mut self,
        _ctx: &Context,
        _batch: Batch,
    ) -> DbResult<Box<dyn BatchResults + 'a>> {
        self.handle()?;
        Err(DatabaseError::batch_unsupported(DriverKind::Orm))
    }
}

#[async_trait]
impl Connection for OrmConnection {
    async fn begin_transaction_with_options<'a>(
        &'a mut self,
        ctx: &Context,
        opts: TxOptions,
    ) -> DbResult<Box<dyn Transaction + 'a>> {
        let ctx = self.query_ctx(ctx);
        let db = self.handle()?;

        debug!(options = ?opts, "Beginning transaction");
        let tx = ctx
            .run("begin transaction", async {
                db.begin_with_config(opts.isolation.map(isolation), opts.access_mode.map(access_mode))
                    .await
                    .map_err(DatabaseError::from)
            })
            .await?;
        // dropping `tx` on any error below rolls it back
        if opts.deferrable {
            execute(&tx, &ctx, "SET TRANSACTION DEFERRABLE", &[]).await?;
        }
        // the pinned session of the transaction is the only place a tenant
        // setting reliably applies on this backend
        if let Some((setting, tenant)) = self.hooks.tenant_for(&ctx) {
            let args = [Value::from(setting), Value::from(tenant)];
            execute(&tx, &ctx, SET_LOCAL_CONFIG_SQL, &args).await?;
        }
        Ok(Box::new(OrmTransaction {
            tx: Some(tx),
            state: TxState::Active,
            query_timeout: self.query_timeout,
        }))
    }

    async fn after_acquire_hook(&mut self, ctx: &Context) -> DbResult<()> {
        self.handle()?;
        let hooks = Arc::clone(&self.hooks);
        hooks.run(ctx, HookPhase::AfterAcquire, self).await
    }

    async fn before_release_hook(&mut self, ctx: &Context) -> DbResult<()> {
        self.handle()?;
        let hooks = Arc::clone(&self.hooks);
        hooks.run(ctx, HookPhase::BeforeRelease, self).await
    }

    async fn release(&mut self, _ctx: &Context) {
        if self.db.is_none() {
            return;
        }
        let hooks = Arc::clone(&self.hooks);
        hooks.run_release(self).await;
        self.db = None;
        debug!("Connection released");
    }

    async fn ping(&mut self, ctx: &Context) -> DbResult<()> {
        let ctx = self.query_ctx(ctx);
        let db = self.handle()?;
        ctx.run("ping", async { db.ping().await.map_err(DatabaseError::from) })
            .await
    }

    fn is_released(&self) -> bool {
        self.db.is_none()
    }

    fn driver(&self) -> DriverKind {
        DriverKind::Orm
    }
}

// ========== Transaction ==========

pub struct OrmTransaction {
    tx: Option<DatabaseTransaction>,
    state: TxState,
    query_timeout: Duration,
}

impl OrmTransaction {
    fn inactive(&self) -> DatabaseError {
        DatabaseError::transaction_state(format!("transaction already {}", self.state))
    }

    fn handle(&self) -> DbResult<&DatabaseTransaction> {
        match &self.tx {
            Some(tx) if self.state == TxState::Active => Ok(tx),
            _ => Err(self.inactive()),
        }
    }

    fn take_active(&mut self) -> DbResult<DatabaseTransaction> {
        match self.tx.take() {
            Some(tx) if self.state == TxState::Active => Ok(tx),
            _ => Err(self.inactive()),
        }
    }
}

#[async_trait]
impl Queryer for OrmTransaction {
    async fn query_one(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Record> {
        let ctx = ctx.bounded(self.query_timeout);
        fetch_one(self.handle()?, &ctx, sql, args).await
    }

    async fn query_all(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Vec<Record>> {
        let ctx = ctx.bounded(self.query_timeout);
        fetch_all(self.handle()?, &ctx, sql, args).await
    }

    async fn query<'a>(
        &'a mut self,
        _ctx: &Context,
        _sql: &'a str,
        _args: &[Value],
    ) -> DbResult<Box<dyn Rows + 'a>> {
        self.handle()?;
        Err(cursor_unsupported("query"))
    }

    async fn query_row(
        &mut self,
        _ctx: &Context,
        _sql: &str,
        _args: &[Value],
    ) -> DbResult<Box<dyn Row>> {
        self.handle()?;
        Err(cursor_unsupported("query_row"))
    }

    async fn query_rows(
        &mut self,
        _ctx: &Context,
        _sql: &str,
        _args: &[Value],
    ) -> DbResult<Vec<Box<dyn Row>>> {
        self.handle()?;
        Err(cursor_unsupported("query_rows"))
    }

    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64> {
        let ctx = ctx.bounded(self.query_timeout);
        execute(self.handle()?, &ctx, sql, args).await
    }

    async fn send_batch<'a>(
        &'a mut self,
        _ctx: &Context,
        _batch: Batch,
    ) -> DbResult<Box<dyn BatchResults + 'a>> {
        self.handle()?;
        Err(DatabaseError::batch_unsupported(DriverKind::Orm))
    }
}

#[async_trait]
impl Transaction for OrmTransaction {
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

    async fn begin_nested_transaction<'a>(
        &'a mut self,
        ctx: &Context,
    ) -> DbResult<Box<dyn Transaction + 'a>> {
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
    use serde_json::json;

    impl OrmConnection {
        fn detached(hooks: HookChain) -> Self {
            Self {
                db: None,
                hooks: Arc::new(hooks),
                query_timeout: Duration::from_secs(1),
            }
        }
    }

    fn disconnected() -> OrmConnection {
        OrmConnection::new(
            DatabaseConnection::Disconnected,
            Arc::new(HookChain::default()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_json_to_record_keeps_column_order() {
        let record = json_to_record(json!({"id": 7, "name": "alice", "score": 1.5, "tags": [1]}))
            .unwrap();
        assert_eq!(record.columns(), ["id", "name", "score", "tags"]);
        assert_eq!(record.get("id"), Some(&Value::Int(7)));
        assert_eq!(record.get("name"), Some(&Value::Text("alice".into())));
        assert_eq!(record.get("tags"), Some(&Value::Json(json!([1]))));

        let err = json_to_record(json!(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_statement_binds_values() {
        let stmt = statement("SELECT $1, $2", &[Value::Int(1), Value::Null]);
        let values = stmt.values.unwrap();
        assert_eq!(values.0.len(), 2);
        assert_eq!(values.0[0], sea_orm::Value::BigInt(Some(1)));
        assert!(statement("SELECT 1", &[]).values.is_none());
    }

    #[tokio::test]
    async fn test_cursor_operations_unsupported() {
        let ctx = Context::background();
        let mut conn = disconnected();
        let err = conn.query(&ctx, "SELECT 1", &[]).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let err = conn.query_row(&ctx, "SELECT 1", &[]).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let err = conn.query_rows(&ctx, "SELECT 1", &[]).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let err = conn.send_batch(&ctx, Batch::new()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::BatchUnsupported);
    }

    #[tokio::test]
    async fn test_released_connection_rejects_operations() {
        let ctx = Context::background();
        let hooks = HookChain::from_config(&Config::default().with_multi_tenant(true));
        let mut conn = OrmConnection::detached(hooks);
        assert!(conn.is_released());
        assert_eq!(conn.driver(), DriverKind::Orm);

        let err = conn.query_all(&ctx, "SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReleased);
        let err = conn.query(&ctx, "SELECT 1", &[]).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionReleased);
        let err = conn.begin_transaction(&ctx).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionReleased);
        conn.release(&ctx).await;
        assert!(conn.is_released());
    }

    #[test]
    fn test_isolation_mapping() {
        assert_eq!(
            isolation(IsolationLevel::RepeatableRead),
            sea_orm::IsolationLevel::RepeatableRead
        );
        assert_eq!(access_mode(AccessMode::ReadOnly), sea_orm::AccessMode::ReadOnly);
    }
}
