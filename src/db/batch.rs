//! Statement batches.
//!
//! A [`Batch`] is a FIFO list of statements. Backends that can pipeline run
//! every statement at once and replay the stored outcomes
//! ([`PreparedBatchResults`]); the others run one statement per result call
//! ([`EmulatedBatchResults`]), so a failing statement only affects its own
//! result.

use crate::db::context::Context;
use crate::db::row::collect_rows;
use crate::db::traits::{BatchResults, Queryer};
use crate::error::{DatabaseError, DbResult};
use crate::models::{Record, Value};
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedStatement {
    pub sql: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    statements: Vec<QueuedStatement>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a statement.
    pub fn queue(&mut self, sql: impl Into<String>, args: Vec<Value>) -> &mut Self {
        self.statements.push(QueuedStatement {
            sql: sql.into(),
            args,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[QueuedStatement] {
        &self.statements
    }

    pub fn into_statements(self) -> Vec<QueuedStatement> {
        self.statements
    }
}

// ========== Pipelined ==========

/// Result of one statement that already ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOutcome {
    pub records: Vec<Record>,
    pub rows_affected: u64,
}

/// Replays outcomes collected up front.
#[derive(Debug, Default)]
pub struct PreparedBatchResults {
    outcomes: VecDeque<DbResult<StatementOutcome>>,
}

impl PreparedBatchResults {
    pub fn new(outcomes: Vec<DbResult<StatementOutcome>>) -> Self {
        Self {
            outcomes: outcomes.into(),
        }
    }

    fn next_outcome(&mut self) -> DbResult<StatementOutcome> {
        self.outcomes
            .pop_front()
            .unwrap_or_else(|| Err(DatabaseError::no_more_results()))
    }
}

#[async_trait]
impl BatchResults for PreparedBatchResults {
    async fn exec(&mut self) -> DbResult<u64> {
        self.next_outcome().map(|o| o.rows_affected)
    }

    async fn query(&mut self) -> DbResult<Vec<Record>> {
        self.next_outcome().map(|o| o.records)
    }

    async fn query_row(&mut self) -> DbResult<Record> {
        let outcome = self.next_outcome()?;
        outcome
            .records
            .into_iter()
            .next()
            .ok_or_else(|| DatabaseError::not_found("no rows in result set"))
    }

    /// Discards the unread outcomes and returns the first error among them.
    async fn close(&mut self) -> DbResult<()> {
        let first_err = self.outcomes.drain(..).find_map(Result::err);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ========== Emulated ==========

/// Runs queued statements one at a time on a [`Queryer`], each when its
/// result is requested.
pub struct EmulatedBatchResults<'a> {
    conn: &'a mut (dyn Queryer + 'a),
    ctx: Context,
    pending: VecDeque<QueuedStatement>,
    index: usize,
}

impl<'a> EmulatedBatchResults<'a> {
    pub fn new(conn: &'a mut (dyn Queryer + 'a), ctx: &Context, batch: Batch) -> Self {
        Self {
            conn,
            ctx: ctx.clone(),
            pending: batch.into_statements().into(),
            index: 0,
        }
    }

    fn next_statement(&mut self) -> DbResult<QueuedStatement> {
        let stmt = self
            .pending
            .pop_front()
            .ok_or_else(DatabaseError::no_more_results)?;
        debug!(index = self.index, sql = %stmt.sql, "Running batched statement");
        self.index += 1;
        Ok(stmt)
    }
}

#[async_trait]
impl BatchResults for EmulatedBatchResults<'_> {
    async fn exec(&mut self) -> DbResult<u64> {
        let stmt = self.next_statement()?;
        self.conn.exec(&self.ctx, &stmt.sql, &stmt.args).await
    }

    async fn query(&mut self) -> DbResult<Vec<Record>> {
        let stmt = self.next_statement()?;
        let rows = self.conn.query(&self.ctx, &stmt.sql, &stmt.args).await?;
        collect_rows(rows).await
    }

    async fn query_row(&mut self) -> DbResult<Record> {
        let stmt = self.next_statement()?;
        self.conn.query_one(&self.ctx, &stmt.sql, &stmt.args).await
    }

    /// Drops the statements that were never requested without running them.
    async fn close(&mut self) -> DbResult<()> {
        if !self.pending.is_empty() {
            debug!(skipped = self.pending.len(), "Discarding unread batched statements");
        }
        self.pending.clear();
        Ok(())
    }
}
