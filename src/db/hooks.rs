//! Connection lifecycle hooks.
//!
//! A [`HookChain`] holds an ordered list of [`HookStep`]s per
//! [`HookPhase`]. Multi-tenancy adds a step that tags the session with the
//! tenant id after acquire and one that clears it before release, so a
//! pooled session never carries a previous tenant's id.

use crate::config::Config;
use crate::db::context::Context;
use crate::error::{DatabaseError, DbResult};
use crate::models::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Sets a custom session parameter for the rest of the session.
pub const SET_CONFIG_SQL: &str = "SELECT set_config($1, $2, false)";

/// Sets a custom session parameter until the current transaction ends.
pub const SET_LOCAL_CONFIG_SQL: &str = "SELECT set_config($1, $2, true)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    AfterAcquire,
    BeforeRelease,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AfterAcquire => write!(f, "after_acquire"),
            Self::BeforeRelease => write!(f, "before_release"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookStep {
    /// Set `setting` to the context value under `context_key`.
    SetTenant { setting: String, context_key: String },
    /// Reset `setting` to the empty string.
    ClearTenant { setting: String },
    /// Run a statement without arguments.
    Custom(String),
}

/// Runs hook statements on a backend's native handle.
#[async_trait]
pub trait HookExecutor: Send {
    async fn execute_hook(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookChain {
    after_acquire: Vec<HookStep>,
    before_release: Vec<HookStep>,
    timeout: Duration,
    require_tenant: bool,
    transaction_tenant: bool,
}

impl HookChain {
    pub fn from_config(config: &Config) -> Self {
        let tenant = &config.multi_tenant;
        let mut after_acquire = Vec::new();
        let mut before_release = Vec::new();

        if config.hooks.is_enabled(HookPhase::AfterAcquire) {
            if tenant.enabled {
                after_acquire.push(HookStep::SetTenant {
                    setting: tenant.setting.clone(),
                    context_key: tenant.context_key.clone(),
                });
            }
            after_acquire.extend(
                config
                    .hooks
                    .custom(HookPhase::AfterAcquire)
                    .iter()
                    .cloned()
                    .map(HookStep::Custom),
            );
        }

        if config.hooks.is_enabled(HookPhase::BeforeRelease) {
            before_release.extend(
                config
                    .hooks
                    .custom(HookPhase::BeforeRelease)
                    .iter()
                    .cloned()
                    .map(HookStep::Custom),
            );
            if tenant.enabled {
                before_release.push(HookStep::ClearTenant {
                    setting: tenant.setting.clone(),
                });
            }
        }

        Self {
            after_acquire,
            before_release,
            timeout: config.hooks.timeout,
            require_tenant: tenant.enabled && tenant.rls_enabled,
            transaction_tenant: false,
        }
    }

    /// Keep the tenant out of session state: the set and clear steps become
    /// no-ops and the tenant is only applied transaction-locally through
    /// [`HookChain::tenant_for`]. For handles that multiplex statements over
    /// several physical sessions.
    pub fn transaction_scoped_tenant(mut self) -> Self {
        self.transaction_tenant = true;
        self
    }

    pub fn steps(&self, phase: HookPhase) -> &[HookStep] {
        match phase {
            HookPhase::AfterAcquire => &self.after_acquire,
            HookPhase::BeforeRelease => &self.before_release,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.after_acquire.is_empty() && self.before_release.is_empty()
    }

    /// True when releasing a connection has to run statements on it.
    pub fn has_release_steps(&self) -> bool {
        !self.before_release.is_empty()
    }

    /// The tenant setting and the tenant id for `ctx`, when the chain tags
    /// sessions and the context carries a tenant.
    pub fn tenant_for<'c>(&self, ctx: &'c Context) -> Option<(&str, &'c str)> {
        self.after_acquire.iter().find_map(|step| match step {
            HookStep::SetTenant {
                setting,
                context_key,
            } => ctx.value(context_key).map(|id| (setting.as_str(), id)),
            _ => None,
        })
    }

    /// Run every step of `phase` and return the first error.
    pub async fn run(
        &self,
        ctx: &Context,
        phase: HookPhase,
        executor: &mut (dyn HookExecutor + '_),
    ) -> DbResult<()> {
        let mut first_err = None;
        for step in self.steps(phase) {
            if let Err(err) = self.run_step(ctx, step, executor).await {
                debug!(phase = %phase, error = %err, "Hook step failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run the before-release steps on a fresh context, so a cancelled or
    /// expired caller cannot skip the tenant reset. Returns false when a
    /// step failed; the session must then not go back to the pool.
    pub async fn run_release(&self, executor: &mut (dyn HookExecutor + '_)) -> bool {
        match self
            .run(&Context::background(), HookPhase::BeforeRelease, executor)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Before-release hook failed");
                false
            }
        }
    }

    async fn run_step(
        &self,
        ctx: &Context,
        step: &HookStep,
        executor: &mut (dyn HookExecutor + '_),
    ) -> DbResult<()> {
        let step_ctx = ctx.bounded(self.timeout);
        match step {
            HookStep::SetTenant {
                setting,
                context_key,
            } => {
                let Some(tenant_id) = ctx.value(context_key) else {
                    if self.require_tenant {
                        return Err(DatabaseError::invalid_value(format!(
                            "row-level security requires a tenant id under '{context_key}'"
                        )));
                    }
                    debug!(setting = %setting, "No tenant id in context, skipping tenant hook");
                    return Ok(());
                };
                if self.transaction_tenant {
                    debug!(setting = %setting, "Tenant is transaction scoped, not tagging the session");
                    return Ok(());
                }
                let args = [Value::from(setting.as_str()), Value::from(tenant_id)];
                step_ctx
                    .run(
                        "set tenant",
                        executor.execute_hook(&step_ctx, SET_CONFIG_SQL, &args),
                    )
                    .await
            }
            HookStep::ClearTenant { setting } => {
                if self.transaction_tenant {
                    return Ok(());
                }
                let args = [Value::from(setting.as_str()), Value::from("")];
                step_ctx
                    .run(
                        "clear tenant",
                        executor.execute_hook(&step_ctx, SET_CONFIG_SQL, &args),
                    )
                    .await
            }
            HookStep::Custom(sql) => {
                step_ctx
                    .run("hook", executor.execute_hook(&step_ctx, sql, &[]))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Vec<(String, Vec<Value>)>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl HookExecutor for RecordingExecutor {
        async fn execute_hook(&mut self, _: &Context, sql: &str, args: &[Value]) -> DbResult<()> {
            self.calls.push((sql.to_string(), args.to_vec()));
            if self.fail_on.as_deref() == Some(sql) {
                return Err(DatabaseError::new(ErrorKind::SyntaxError, "bad hook"));
            }
            Ok(())
        }
    }

    fn tenant_config() -> Config {
        Config::default().with_multi_tenant(true)
    }

    #[test]
    fn test_chain_order() {
        let config = tenant_config()
            .with_hook(HookPhase::AfterAcquire, "SET search_path TO app")
            .with_hook(HookPhase::BeforeRelease, "DISCARD TEMP");
        let chain = HookChain::from_config(&config);

        let acquire = chain.steps(HookPhase::AfterAcquire);
        assert!(matches!(acquire[0], HookStep::SetTenant { .. }));
        assert_eq!(acquire[1], HookStep::Custom("SET search_path TO app".into()));

        let release = chain.steps(HookPhase::BeforeRelease);
        assert_eq!(release[0], HookStep::Custom("DISCARD TEMP".into()));
        assert!(matches!(release[1], HookStep::ClearTenant { .. }));
        assert!(chain.has_release_steps());
    }

    #[test]
    fn test_disabled_phase_is_empty() {
        let mut config = tenant_config();
        config.hooks.enabled = vec![HookPhase::AfterAcquire];
        let chain = HookChain::from_config(&config);
        assert_eq!(chain.steps(HookPhase::AfterAcquire).len(), 1);
        assert!(chain.steps(HookPhase::BeforeRelease).is_empty());
        assert!(!chain.has_release_steps());
    }

    #[test]
    fn test_no_multi_tenant_no_steps() {
        let chain = HookChain::from_config(&Config::default());
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_tenant_set_and_cleared() {
        let chain = HookChain::from_config(&tenant_config());
        let ctx = Context::background().with_tenant("tenant-42");
        let mut exec = RecordingExecutor::default();

        chain
            .run(&ctx, HookPhase::AfterAcquire, &mut exec)
            .await
            .unwrap();
        chain
            .run(&ctx, HookPhase::BeforeRelease, &mut exec)
            .await
            .unwrap();

        assert_eq!(
            exec.calls,
            vec![
                (
                    SET_CONFIG_SQL.to_string(),
                    vec![Value::from("app.tenant_id"), Value::from("tenant-42")]
                ),
                (
                    SET_CONFIG_SQL.to_string(),
                    vec![Value::from("app.tenant_id"), Value::from("")]
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_tenant_skips_set() {
        let chain = HookChain::from_config(&tenant_config());
        let mut exec = RecordingExecutor::default();
        chain
            .run(&Context::background(), HookPhase::AfterAcquire, &mut exec)
            .await
            .unwrap();
        assert!(exec.calls.is_empty());
    }

    #[tokio::test]
    async fn test_missing_tenant_with_rls_fails() {
        let mut config = tenant_config();
        config.multi_tenant.rls_enabled = true;
        let chain = HookChain::from_config(&config);
        let mut exec = RecordingExecutor::default();
        let err = chain
            .run(&Context::background(), HookPhase::AfterAcquire, &mut exec)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[tokio::test]
    async fn test_all_steps_run_first_error_returned() {
        let config = tenant_config()
            .with_hook(HookPhase::BeforeRelease, "BROKEN")
            .with_hook(HookPhase::BeforeRelease, "DISCARD TEMP");
        let chain = HookChain::from_config(&config);
        let mut exec = RecordingExecutor {
            fail_on: Some("BROKEN".into()),
            ..Default::default()
        };

        let err = chain
            .run(&Context::background(), HookPhase::BeforeRelease, &mut exec)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SyntaxError);
        assert_eq!(exec.calls.len(), 3);
        assert_eq!(exec.calls[2].0, SET_CONFIG_SQL);

        // release swallows the error and reports it
        assert!(!chain.run_release(&mut exec).await);
        assert_eq!(exec.calls.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        struct Stuck;

        #[async_trait]
        impl HookExecutor for Stuck {
            async fn execute_hook(&mut self, _: &Context, _: &str, _: &[Value]) -> DbResult<()> {
                std::future::pending().await
            }
        }

        let mut config = Config::default().with_hook(HookPhase::AfterAcquire, "SELECT 1");
        config.hooks.timeout = Duration::from_millis(20);
        let chain = HookChain::from_config(&config);
        let err = chain
            .run(&Context::background(), HookPhase::AfterAcquire, &mut Stuck)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
    }

    #[tokio::test]
    async fn test_release_runs_despite_cancelled_caller() {
        let chain = HookChain::from_config(&tenant_config());
        let (ctx, token) = Context::background().with_tenant("tenant-42").with_cancel();
        let mut exec = RecordingExecutor::default();
        chain
            .run(&ctx, HookPhase::AfterAcquire, &mut exec)
            .await
            .unwrap();
        token.cancel();

        assert!(chain.run_release(&mut exec).await);
        assert_eq!(
            exec.calls.last(),
            Some(&(
                SET_CONFIG_SQL.to_string(),
                vec![Value::from("app.tenant_id"), Value::from("")]
            ))
        );
    }

    #[tokio::test]
    async fn test_release_reports_failed_step() {
        let config = tenant_config().with_hook(HookPhase::BeforeRelease, "BROKEN");
        let chain = HookChain::from_config(&config);
        let mut exec = RecordingExecutor {
            fail_on: Some("BROKEN".into()),
            ..Default::default()
        };
        assert!(!chain.run_release(&mut exec).await);
        // the clear still ran after the failing step
        assert_eq!(exec.calls.len(), 2);
    }

    #[tokio::test]
    async fn test_transaction_scoped_tenant_skips_session_steps() {
        let chain = HookChain::from_config(&tenant_config()).transaction_scoped_tenant();
        let ctx = Context::background().with_tenant("tenant-42");
        let mut exec = RecordingExecutor::default();

        chain
            .run(&ctx, HookPhase::AfterAcquire, &mut exec)
            .await
            .unwrap();
        assert!(chain.run_release(&mut exec).await);
        assert!(exec.calls.is_empty());
        assert_eq!(chain.tenant_for(&ctx), Some(("app.tenant_id", "tenant-42")));
    }

    #[test]
    fn test_tenant_for() {
        let chain = HookChain::from_config(&tenant_config());
        let ctx = Context::background().with_tenant("t1");
        assert_eq!(chain.tenant_for(&ctx), Some(("app.tenant_id", "t1")));
        assert_eq!(chain.tenant_for(&Context::background()), None);
        let plain = HookChain::from_config(&Config::default());
        assert_eq!(plain.tenant_for(&ctx), None);
    }

    #[test]
    fn test_phase_serde() {
        let json = serde_json::to_string(&HookPhase::BeforeRelease).unwrap();
        assert_eq!(json, "\"before_release\"");
        assert_eq!(HookPhase::AfterAcquire.to_string(), "after_acquire");
    }
}
