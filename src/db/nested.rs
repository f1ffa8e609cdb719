//! Nested transactions on top of savepoints.

use crate::db::batch::Batch;
use crate::db::context::Context;
use crate::db::traits::{BatchResults, Queryer, Row, Rows, Transaction};
use crate::error::{DatabaseError, DbResult};
use crate::models::{Record, TxState, Value};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static NEXT_SAVEPOINT: AtomicU64 = AtomicU64::new(1);

fn next_savepoint_name() -> String {
    format!(
        "pgbridge_sp_{}",
        NEXT_SAVEPOINT.fetch_add(1, Ordering::Relaxed)
    )
}

/// A savepoint inside a parent transaction, driven through the
/// [`Transaction`] contract.
///
/// `commit` releases the savepoint, `rollback` rolls back to it and then
/// releases it. The parent stays borrowed until this value is dropped.
/// Dropping it while active leaves the savepoint in place; the parent's
/// own commit or rollback settles it.
pub struct NestedTransaction<'a> {
    parent: &'a mut (dyn Transaction + 'a),
    name: String,
    state: TxState,
}

impl<'a> NestedTransaction<'a> {
    pub async fn begin(parent: &'a mut (dyn Transaction + 'a), ctx: &Context) -> DbResult<Self> {
        if parent.state().is_terminal() {
            return Err(DatabaseError::transaction_state(format!(
                "cannot nest inside a {} transaction",
                parent.state()
            )));
        }
        let name = next_savepoint_name();
        parent.savepoint(ctx, &name).await?;
        debug!(savepoint = %name, "Nested transaction started");
        Ok(Self {
            parent,
            name,
            state: TxState::Active,
        })
    }

    pub fn savepoint_name(&self) -> &str {
        &self.name
    }

    fn ensure_active(&self) -> DbResult<()> {
        if self.state.is_terminal() {
            Err(DatabaseError::transaction_state(format!(
                "nested transaction already {}",
                self.state
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Queryer for NestedTransaction<'_> {
    async fn query_one(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Record> {
        self.ensure_active()?;
        self.parent.query_one(ctx, sql, args).await
    }

    async fn query_all(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Vec<Record>> {
        self.ensure_active()?;
        self.parent.query_all(ctx, sql, args).await
    }

    async fn query<'b>(
        &'b mut self,
        ctx: &Context,
        sql: &'b str,
        args: &[Value],
    ) -> DbResult<Box<dyn Rows + 'b>> {
        self.ensure_active()?;
        self.parent.query(ctx, sql, args).await
    }

    async fn query_row(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Box<dyn Row>> {
        self.ensure_active()?;
        self.parent.query_row(ctx, sql, args).await
    }

    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<u64> {
        self.ensure_active()?;
        self.parent.exec(ctx, sql, args).await
    }

    async fn send_batch<'b>(
        &'b mut self,
        ctx: &Context,
        batch: Batch,
    ) -> DbResult<Box<dyn BatchResults + 'b>> {
        self.ensure_active()?;
        self.parent.send_batch(ctx, batch).await
    }
}

#[async_trait]
impl Transaction for NestedTransaction<'_> {
    async fn commit(&mut self, ctx: &Context) -> DbResult<()> {
        self.ensure_active()?;
        self.parent.release_savepoint(ctx, &self.name).await?;
        self.state = TxState::Committed;
        debug!(savepoint = %self.name, "Nested transaction committed");
        Ok(())
    }

    async fn rollback(&mut self, ctx: &Context) -> DbResult<()> {
        self.ensure_active()?;
        self.parent.rollback_to_savepoint(ctx, &self.name).await?;
        self.state = TxState::RolledBack;
        self.parent.release_savepoint(ctx, &self.name).await?;
        debug!(savepoint = %self.name, "Nested transaction rolled back");
        Ok(())
    }

    async fn begin_nested_transaction<'b>(
        &'b mut self,
        ctx: &Context,
    ) -> DbResult<Box<dyn Transaction + 'b>> {
        self.ensure_active()?;
        let nested = NestedTransaction::begin(self, ctx).await?;
        Ok(Box::new(nested))
    }

    fn state(&self) -> TxState {
        self.state
    }
}

impl Drop for NestedTransaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            warn!(savepoint = %self.name, "Nested transaction dropped while active");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    /// Transaction fake that records every statement.
    #[derive(Default)]
    struct ScriptTx {
        log: Vec<String>,
        state: TxState,
    }

    #[async_trait]
    impl Queryer for ScriptTx {
        async fn query_one(&mut self, _: &Context, sql: &str, _: &[Value]) -> DbResult<Record> {
            self.log.push(sql.to_string());
            Ok(Record::default())
        }

        async fn query_all(
            &mut self,
            _: &Context,
            sql: &str,
            _: &[Value],
        ) -> DbResult<Vec<Record>> {
            self.log.push(sql.to_string());
            Ok(Vec::new())
        }

        async fn query<'b>(
            &'b mut self,
            _: &Context,
            _: &'b str,
            _: &[Value],
        ) -> DbResult<Box<dyn Rows + 'b>> {
            Err(DatabaseError::unsupported("not used"))
        }

        async fn query_row(
            &mut self,
            _: &Context,
            _: &str,
            _: &[Value],
        ) -> DbResult<Box<dyn Row>> {
            Err(DatabaseError::unsupported("not used"))
        }

        async fn exec(&mut self, _: &Context, sql: &str, _: &[Value]) -> DbResult<u64> {
            self.log.push(sql.to_string());
            Ok(0)
        }

        async fn send_batch<'b>(
            &'b mut self,
            _: &Context,
            _: Batch,
        ) -> DbResult<Box<dyn BatchResults + 'b>> {
            Err(DatabaseError::batch_unsupported("script"))
        }
    }

    #[async_trait]
    impl Transaction for ScriptTx {
        async fn commit(&mut self, _: &Context) -> DbResult<()> {
            self.state = TxState::Committed;
            Ok(())
        }

        async fn rollback(&mut self, _: &Context) -> DbResult<()> {
            self.state = TxState::RolledBack;
            Ok(())
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

    #[tokio::test]
    async fn test_nested_commit_releases_savepoint() {
        let ctx = Context::background();
        let mut tx = ScriptTx::default();
        {
            let mut nested = tx.begin_nested_transaction(&ctx).await.unwrap();
            nested.exec(&ctx, "INSERT INTO t VALUES (1)", &[]).await.unwrap();
            nested.commit(&ctx).await.unwrap();
            assert_eq!(nested.state(), TxState::Committed);
        }
        assert_eq!(tx.log.len(), 3);
        assert!(tx.log[0].starts_with("SAVEPOINT pgbridge_sp_"));
        assert_eq!(tx.log[1], "INSERT INTO t VALUES (1)");
        assert!(tx.log[2].starts_with("RELEASE SAVEPOINT pgbridge_sp_"));
    }

    #[tokio::test]
    async fn test_nested_rollback_returns_to_savepoint() {
        let ctx = Context::background();
        let mut tx = ScriptTx::default();
        let name = {
            let mut nested = NestedTransaction::begin(&mut tx, &ctx).await.unwrap();
            nested.rollback(&ctx).await.unwrap();
            nested.savepoint_name().to_string()
        };
        assert_eq!(
            tx.log,
            vec![
                format!("SAVEPOINT {name}"),
                format!("ROLLBACK TO SAVEPOINT {name}"),
                format!("RELEASE SAVEPOINT {name}"),
            ]
        );
        assert_eq!(tx.state, TxState::Active);
    }

    #[tokio::test]
    async fn test_nested_terminal_state() {
        let ctx = Context::background();
        let mut tx = ScriptTx::default();
        let mut nested = NestedTransaction::begin(&mut tx, &ctx).await.unwrap();
        nested.commit(&ctx).await.unwrap();
        let err = nested.commit(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransactionState);
        let err = nested.exec(&ctx, "SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransactionState);
    }

    #[tokio::test]
    async fn test_generated_names_are_distinct() {
        let ctx = Context::background();
        let mut tx = ScriptTx::default();
        let first = {
            let mut nested = NestedTransaction::begin(&mut tx, &ctx).await.unwrap();
            nested.commit(&ctx).await.unwrap();
            nested.savepoint_name().to_string()
        };
        let second = {
            let mut nested = NestedTransaction::begin(&mut tx, &ctx).await.unwrap();
            nested.commit(&ctx).await.unwrap();
            nested.savepoint_name().to_string()
        };
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_cannot_nest_in_finished_transaction() {
        let ctx = Context::background();
        let mut tx = ScriptTx {
            state: TxState::Committed,
            ..Default::default()
        };
        let err = NestedTransaction::begin(&mut tx, &ctx).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidTransactionState);
    }
}
