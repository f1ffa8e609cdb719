//! Request context: cancellation, deadline and request-scoped values.
//!
//! Every blocking operation takes a [`Context`]. Backend futures are raced
//! against the context, so a cancelled or expired context makes the call
//! return promptly even when the driver cannot interrupt the I/O itself.

use crate::config::DEFAULT_TENANT_CONTEXT_KEY;
use crate::error::{DatabaseError, DbResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    values: Arc<HashMap<String, String>>,
}

impl Context {
    /// A context that never expires and is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that can be cancelled independently of its parent.
    /// Cancelling the parent still cancels the child.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = self.cancel.child_token();
        let ctx = Self {
            cancel: token.clone(),
            ..self.clone()
        };
        (ctx, token)
    }

    /// Derive a context that expires after `timeout`, or at the parent's
    /// deadline if that comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Narrow by `timeout` unless it is zero.
    pub fn bounded(&self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            self.clone()
        } else {
            self.with_timeout(timeout)
        }
    }

    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), value.into());
        Self {
            values: Arc::new(values),
            ..self.clone()
        }
    }

    /// Attach a tenant id under the default tenant key.
    pub fn with_tenant(&self, tenant_id: impl Into<String>) -> Self {
        self.with_value(DEFAULT_TENANT_CONTEXT_KEY, tenant_id)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Tenant id stored under the default tenant key.
    pub fn tenant_id(&self) -> Option<&str> {
        self.value(DEFAULT_TENANT_CONTEXT_KEY)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_expired()
    }

    /// Fail if the context is already done.
    pub fn check(&self, operation: &str) -> DbResult<()> {
        if self.is_cancelled() {
            Err(DatabaseError::cancelled(operation))
        } else if self.is_expired() {
            Err(DatabaseError::timeout(operation))
        } else {
            Ok(())
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = sleep_until(self.deadline) => {}
        }
    }

    /// Run `fut`, giving up with `Cancelled` or `ConnectionTimeout` when the
    /// context ends first.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        self.check(operation)?;
        tokio::select! {
            biased;
            result = fut => result,
            _ = self.cancel.cancelled() => Err(DatabaseError::cancelled(operation)),
            _ = sleep_until(self.deadline) => Err(DatabaseError::timeout(operation)),
        }
    }

    /// Like [`Context::run`], additionally awaiting `on_abort` when the
    /// context wins, so the backend can be told to stop the work server-side.
    pub async fn run_abortable<T, F, A, AF>(&self, operation: &str, fut: F, on_abort: A) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
        A: FnOnce() -> AF,
        AF: Future<Output = ()>,
    {
        let result = self.run(operation, fut).await;
        if let Err(err) = &result {
            if matches!(
                err.kind(),
                crate::error::ErrorKind::Cancelled | crate::error::ErrorKind::ConnectionTimeout
            ) && self.is_done()
            {
                on_abort().await;
            }
        }
        result
    }

    /// Sleep for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> DbResult<()> {
        self.run("sleep", async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
