//! Configuration for pgbridge.
//!
//! A [`Config`] is built once (by hand, from serde, or from the command line
//! through [`CliArgs`]), validated with [`Config::validate`], and handed to a
//! provider by value. Named options (`with_*`) return a modified copy and
//! never touch the original.

use crate::db::hooks::HookPhase;
use crate::db::is_plain_identifier;
use clap::{Parser, ValueEnum};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_DATABASE: &str = "postgres";
pub const DEFAULT_APPLICATION_NAME: &str = "pgbridge";

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_MAX_CONN_LIFETIME_SECS: u64 = 3600;
pub const DEFAULT_MAX_CONN_IDLE_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 5;

pub const DEFAULT_TENANT_SETTING: &str = "app.tenant_id";
pub const DEFAULT_TENANT_CONTEXT_KEY: &str = "tenant_id";

/// Configuration errors. The message always names the offending field.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("malformed connection string: {0}")]
    Dsn(String),
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }

    /// Name of the offending field, if the error is about one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Invalid { field, .. } => Some(field),
            Self::Dsn(_) => None,
        }
    }
}

/// Backend selection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// tokio-postgres client pooled by deadpool-postgres
    #[default]
    Wire,
    /// sea-orm database connection
    Orm,
    /// sqlx pool
    Sql,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire => write!(f, "wire"),
            Self::Orm => write!(f, "orm"),
            Self::Sql => write!(f, "sql"),
        }
    }
}

/// `sslmode` as understood by libpq.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    #[default]
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "allow" => Ok(Self::Allow),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            other => Err(ConfigError::invalid(
                "ssl_mode",
                format!("unknown sslmode '{other}'"),
            )),
        }
    }
}

/// Connection pool limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Connections older than this are closed instead of reused. Zero disables.
    pub max_conn_lifetime: Duration,
    /// Connections idle longer than this are closed instead of reused. Zero disables.
    pub max_conn_idle_time: Duration,
    /// Native wait limit for a free connection.
    pub acquire_timeout: Duration,
    pub test_before_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_conn_lifetime: Duration::from_secs(DEFAULT_MAX_CONN_LIFETIME_SECS),
            max_conn_idle_time: Duration::from_secs(DEFAULT_MAX_CONN_IDLE_SECS),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            test_before_acquire: true,
        }
    }
}

impl PoolConfig {
    /// Validate pool options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::invalid(
                "pool.max_connections",
                "must be greater than 0",
            ));
        }
        if self.min_connections == 0 {
            return Err(ConfigError::invalid(
                "pool.min_connections",
                "must be greater than 0",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::invalid(
                "pool.min_connections",
                format!(
                    "min_connections ({}) cannot exceed max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            ));
        }
        Ok(())
    }
}

/// Timeouts. Zero means "not set" for the server-side ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect: Duration,
    /// Client-side deadline applied to each statement.
    pub query: Duration,
    pub statement: Duration,
    pub lock: Duration,
    pub idle_in_transaction: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            query: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            statement: Duration::ZERO,
            lock: Duration::ZERO,
            idle_in_transaction: Duration::ZERO,
        }
    }
}

impl TimeoutConfig {
    /// Server-side session timeouts as `(parameter, "<ms>ms")`, skipping zeros.
    pub fn session_parameters(&self) -> Vec<(&'static str, String)> {
        [
            ("statement_timeout", self.statement),
            ("lock_timeout", self.lock),
            ("idle_in_transaction_session_timeout", self.idle_in_transaction),
        ]
        .into_iter()
        .filter(|(_, d)| !d.is_zero())
        .map(|(name, d)| (name, format!("{}ms", d.as_millis())))
        .collect()
    }
}

/// Caller-side retry policy, consumed by [`crate::db::retry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Lifecycle hook policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Phases that run at all.
    pub enabled: Vec<HookPhase>,
    /// Extra statements run right after a connection is acquired.
    pub after_acquire: Vec<String>,
    /// Extra statements run right before a connection is released.
    pub before_release: Vec<String>,
    /// Per-statement timeout.
    pub timeout: Duration,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            enabled: vec![HookPhase::AfterAcquire, HookPhase::BeforeRelease],
            after_acquire: Vec::new(),
            before_release: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS),
        }
    }
}

impl HookConfig {
    pub fn is_enabled(&self, phase: HookPhase) -> bool {
        self.enabled.contains(&phase)
    }

    pub fn custom(&self, phase: HookPhase) -> &[String] {
        match phase {
            HookPhase::AfterAcquire => &self.after_acquire,
            HookPhase::BeforeRelease => &self.before_release,
        }
    }
}

/// Session-scoped tenant tagging for row-level security.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiTenantConfig {
    pub enabled: bool,
    pub rls_enabled: bool,
    /// Custom session parameter carrying the tenant id.
    pub setting: String,
    /// Context value key holding the tenant id.
    pub context_key: String,
}

impl Default for MultiTenantConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rls_enabled: false,
            setting: DEFAULT_TENANT_SETTING.to_string(),
            context_key: DEFAULT_TENANT_CONTEXT_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadReplicaConfig {
    pub enabled: bool,
    /// `host` or `host:port` entries.
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    /// `host` or `host:port` entries, tried in order after the primary.
    pub hosts: Vec<String>,
    /// Upper bound on the number of candidates tried, primary included.
    pub max_attempts: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hosts: Vec::new(),
            max_attempts: 3,
        }
    }
}

/// Complete configuration for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverKind,
    /// `postgres://` URL taking precedence over the individual fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
    pub ssl_mode: SslMode,
    pub pool: PoolConfig,
    pub timeouts: TimeoutConfig,
    pub application_name: String,
    pub search_path: String,
    pub timezone: String,
    pub retry: RetryConfig,
    pub hooks: HookConfig,
    pub multi_tenant: MultiTenantConfig,
    pub read_replicas: ReadReplicaConfig,
    pub failover: FailoverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            url: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: String::new(),
            database: DEFAULT_DATABASE.to_string(),
            ssl_mode: SslMode::default(),
            pool: PoolConfig::default(),
            timeouts: TimeoutConfig::default(),
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            search_path: String::new(),
            timezone: String::new(),
            retry: RetryConfig::default(),
            hooks: HookConfig::default(),
            multi_tenant: MultiTenantConfig::default(),
            read_replicas: ReadReplicaConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

impl Config {
    /// Validate the configuration and return the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;

        match &self.url {
            Some(url) => {
                let parsed = Url::parse(url)
                    .map_err(|e| ConfigError::invalid("url", format!("invalid URL: {e}")))?;
                if !matches!(parsed.scheme(), "postgres" | "postgresql") {
                    return Err(ConfigError::invalid(
                        "url",
                        format!("unsupported scheme '{}'", parsed.scheme()),
                    ));
                }
            }
            None => {
                if self.host.trim().is_empty() {
                    return Err(ConfigError::invalid("host", "must not be empty"));
                }
                if self.port == 0 {
                    return Err(ConfigError::invalid("port", "must be greater than 0"));
                }
                if self.database.trim().is_empty() {
                    return Err(ConfigError::invalid("database", "must not be empty"));
                }
            }
        }

        if self.retry.enabled {
            if !(self.retry.multiplier > 1.0) {
                return Err(ConfigError::invalid(
                    "retry.multiplier",
                    format!("must be greater than 1.0, got {}", self.retry.multiplier),
                ));
            }
            if self.retry.initial_interval > self.retry.max_interval {
                return Err(ConfigError::invalid(
                    "retry.initial_interval",
                    "cannot exceed retry.max_interval",
                ));
            }
        }

        if self.multi_tenant.enabled {
            let valid = self
                .multi_tenant
                .setting
                .split_once('.')
                .is_some_and(|(a, b)| is_plain_identifier(a) && is_plain_identifier(b));
            if !valid {
                return Err(ConfigError::invalid(
                    "multi_tenant.setting",
                    format!(
                        "'{}' is not a custom parameter name of the form prefix.name",
                        self.multi_tenant.setting
                    ),
                ));
            }
            if self.multi_tenant.context_key.is_empty() {
                return Err(ConfigError::invalid(
                    "multi_tenant.context_key",
                    "must not be empty",
                ));
            }
        }

        if self.read_replicas.enabled {
            validate_hosts("read_replicas.hosts", &self.read_replicas.hosts)?;
        }
        if self.failover.enabled {
            validate_hosts("failover.hosts", &self.failover.hosts)?;
            if self.failover.max_attempts == 0 {
                return Err(ConfigError::invalid(
                    "failover.max_attempts",
                    "must be greater than 0",
                ));
            }
        }

        Ok(())
    }

    // ========== Named options ==========

    pub fn with_driver(&self, driver: DriverKind) -> Self {
        let mut config = self.clone();
        config.driver = driver;
        config
    }

    pub fn with_url(&self, url: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.url = Some(url.into());
        config
    }

    pub fn with_host(&self, host: impl Into<String>, port: u16) -> Self {
        let mut config = self.clone();
        config.host = host.into();
        config.port = port;
        config
    }

    pub fn with_credentials(&self, user: impl Into<String>, password: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.user = user.into();
        config.password = password.into();
        config
    }

    pub fn with_database(&self, database: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.database = database.into();
        config
    }

    pub fn with_ssl_mode(&self, ssl_mode: SslMode) -> Self {
        let mut config = self.clone();
        config.ssl_mode = ssl_mode;
        config
    }

    pub fn with_pool_size(&self, min_connections: u32, max_connections: u32) -> Self {
        let mut config = self.clone();
        config.pool.min_connections = min_connections;
        config.pool.max_connections = max_connections;
        config
    }

    pub fn with_timeouts(&self, timeouts: TimeoutConfig) -> Self {
        let mut config = self.clone();
        config.timeouts = timeouts;
        config
    }

    pub fn with_application_name(&self, name: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.application_name = name.into();
        config
    }

    pub fn with_search_path(&self, search_path: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.search_path = search_path.into();
        config
    }

    pub fn with_timezone(&self, timezone: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.timezone = timezone.into();
        config
    }

    pub fn with_retry(&self, retry: RetryConfig) -> Self {
        let mut config = self.clone();
        config.retry = retry;
        config
    }

    /// Enable or disable multi-tenancy. Enabling also turns both hook phases on.
    pub fn with_multi_tenant(&self, enabled: bool) -> Self {
        let mut config = self.clone();
        config.multi_tenant.enabled = enabled;
        if enabled {
            for phase in [HookPhase::AfterAcquire, HookPhase::BeforeRelease] {
                if !config.hooks.enabled.contains(&phase) {
                    config.hooks.enabled.push(phase);
                }
            }
        }
        config
    }

    pub fn with_hook(&self, phase: HookPhase, sql: impl Into<String>) -> Self {
        let mut config = self.clone();
        match phase {
            HookPhase::AfterAcquire => config.hooks.after_acquire.push(sql.into()),
            HookPhase::BeforeRelease => config.hooks.before_release.push(sql.into()),
        }
        config
    }

    pub fn with_failover<I, S>(&self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = self.clone();
        config.failover.enabled = true;
        config.failover.hosts = hosts.into_iter().map(Into::into).collect();
        config
    }

    // ========== Connection strings ==========

    /// Keyword DSN for the wire and sql backends.
    pub fn wire_dsn(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let mut pairs = self.base_pairs();
        push_pair(&mut pairs, "timezone", &self.timezone);
        join_pairs(&pairs)
    }

    /// Keyword DSN for the orm backend: the base keys, `TimeZone`, then the
    /// server-side timeouts that are set.
    pub fn orm_dsn(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let mut pairs = self.base_pairs();
        push_pair(&mut pairs, "TimeZone", &self.timezone);
        for (name, value) in self.timeouts.session_parameters() {
            pairs.push((name, value));
        }
        join_pairs(&pairs)
    }

    /// Connection targets in the order connect should try them.
    pub fn candidate_hosts(&self) -> Vec<(String, u16)> {
        let mut hosts = vec![(self.host.clone(), self.port)];
        if self.failover.enabled {
            hosts.extend(
                self.failover
                    .hosts
                    .iter()
                    .filter_map(|h| split_host_port(h, self.port)),
            );
            hosts.truncate(self.failover.max_attempts.max(1) as usize);
        }
        hosts
    }

    /// Parsed connection parameters for each candidate host, for the
    /// backends that build native connect options: the keyword DSN plus the
    /// server-side timeouts as startup options. The first entry keeps the
    /// host of a `url` override.
    pub fn connect_candidates(&self) -> Result<Vec<DsnParts>, ConfigError> {
        let mut base = DsnParts::parse(&self.wire_dsn())?;
        for (name, value) in self.timeouts.session_parameters() {
            base.set_option_default(name, value);
        }
        Ok(self.expand_candidates(base))
    }

    /// Like [`Config::connect_candidates`], parsed from [`Config::orm_dsn`].
    pub fn orm_connect_candidates(&self) -> Result<Vec<DsnParts>, ConfigError> {
        Ok(self.expand_candidates(DsnParts::parse(&self.orm_dsn())?))
    }

    fn expand_candidates(&self, mut base: DsnParts) -> Vec<DsnParts> {
        if base.connect_timeout.is_none() && !self.timeouts.connect.is_zero() {
            base.connect_timeout = Some(self.timeouts.connect);
        }
        self.candidate_hosts()
            .into_iter()
            .enumerate()
            .map(|(i, (host, port))| {
                let mut parts = base.clone();
                if i > 0 || parts.host.is_none() {
                    parts.host = Some(host);
                    parts.port = Some(port);
                }
                parts
            })
            .collect()
    }

    /// Read replica targets, empty unless enabled.
    pub fn replica_hosts(&self) -> Vec<(String, u16)> {
        if !self.read_replicas.enabled {
            return Vec::new();
        }
        self.read_replicas
            .hosts
            .iter()
            .filter_map(|h| split_host_port(h, self.port))
            .collect()
    }

    fn base_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        push_pair(&mut pairs, "host", &self.host);
        pairs.push(("port", self.port.to_string()));
        push_pair(&mut pairs, "user", &self.user);
        push_pair(&mut pairs, "password", &self.password);
        push_pair(&mut pairs, "dbname", &self.database);
        pairs.push(("sslmode", self.ssl_mode.to_string()));
        push_pair(&mut pairs, "application_name", &self.application_name);
        push_pair(&mut pairs, "search_path", &self.search_path);
        pairs
    }
}

fn validate_hosts(field: &'static str, hosts: &[String]) -> Result<(), ConfigError> {
    if hosts.is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty when enabled"));
    }
    for host in hosts {
        if host.trim().is_empty() {
            return Err(ConfigError::invalid(field, "contains an empty host"));
        }
        match parse_host_port(host) {
            Some((_, Some(0))) | None => {
                return Err(ConfigError::invalid(
                    field,
                    format!("'{host}' has an invalid port"),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6 address.
/// `None` when the port is malformed.
fn parse_host_port(entry: &str) -> Option<(String, Option<u16>)> {
    let entry = entry.trim();
    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail {
            "" => Some((host.to_string(), None)),
            _ => {
                let port = tail.strip_prefix(':')?.parse().ok()?;
                Some((host.to_string(), Some(port)))
            }
        };
    }
    match entry.rsplit_once(':') {
        // more than one colon without brackets: an IPv6 address, no port
        Some((host, _)) if host.contains(':') => Some((entry.to_string(), None)),
        Some((host, port)) => Some((host.to_string(), Some(port.parse().ok()?))),
        None => Some((entry.to_string(), None)),
    }
}

fn split_host_port(entry: &str, default_port: u16) -> Option<(String, u16)> {
    if entry.trim().is_empty() {
        return None;
    }
    let (host, port) = parse_host_port(entry)?;
    Some((host, port.unwrap_or(default_port)))
}

fn push_pair(pairs: &mut Vec<(&'static str, String)>, key: &'static str, value: &str) {
    if !value.is_empty() {
        pairs.push((key, value.to_string()));
    }
}

fn join_pairs(pairs: &[(&'static str, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", quote_dsn_value(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote a keyword DSN value when it contains whitespace, quotes or backslashes.
pub fn quote_dsn_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Connection parameters extracted from a keyword DSN or a `postgres://` URL.
///
/// Both the wire and sql backends build their native options from this, so
/// parameters neither driver understands natively (`search_path`,
/// `timezone`, server-side timeouts) end up as `-c key=value` startup
/// options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DsnParts {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: Option<String>,
    pub ssl_mode: Option<SslMode>,
    pub application_name: Option<String>,
    pub connect_timeout: Option<Duration>,
    /// Server parameters sent at startup.
    pub options: Vec<(String, String)>,
}

impl DsnParts {
    /// Parse either DSN form.
    pub fn parse(dsn: &str) -> Result<Self, ConfigError> {
        let trimmed = dsn.trim();
        if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
            Self::from_url(trimmed)
        } else {
            Self::from_pairs(parse_keyword_dsn(trimmed)?)
        }
    }

    fn from_url(dsn: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(dsn).map_err(|e| ConfigError::Dsn(format!("invalid URL: {e}")))?;
        let mut parts = Self {
            // IPv6 hosts without the URL brackets
            host: url.host().map(|host| match host {
                url::Host::Ipv6(addr) => addr.to_string(),
                other => other.to_string(),
            }),
            port: url.port(),
            user: Some(url.username())
                .filter(|u| !u.is_empty())
                .map(percent_decode),
            password: url.password().map(percent_decode),
            dbname: url
                .path()
                .strip_prefix('/')
                .filter(|s| !s.is_empty())
                .map(percent_decode),
            ..Self::default()
        };
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        parts.apply_pairs(pairs)?;
        Ok(parts)
    }

    fn from_pairs(pairs: Vec<(String, String)>) -> Result<Self, ConfigError> {
        let mut parts = Self::default();
        parts.apply_pairs(pairs)?;
        Ok(parts)
    }

    fn apply_pairs(&mut self, pairs: Vec<(String, String)>) -> Result<(), ConfigError> {
        for (key, value) in pairs {
            match key.as_str() {
                "host" | "hostaddr" => self.host = Some(value),
                "port" => {
                    let port = value
                        .parse()
                        .map_err(|_| ConfigError::Dsn(format!("invalid port '{value}'")))?;
                    self.port = Some(port);
                }
                "user" => self.user = Some(value),
                "password" => self.password = Some(value),
                "dbname" => self.dbname = Some(value),
                "sslmode" => {
                    let mode = value
                        .parse()
                        .map_err(|_| ConfigError::Dsn(format!("invalid sslmode '{value}'")))?;
                    self.ssl_mode = Some(mode);
                }
                "application_name" => self.application_name = Some(value),
                "connect_timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        ConfigError::Dsn(format!("invalid connect_timeout '{value}'"))
                    })?;
                    self.connect_timeout = Some(Duration::from_secs(secs));
                }
                // Server parameters are case-insensitive; TimeZone is the
                // canonical spelling.
                _ => self.options.push((key.to_ascii_lowercase(), value)),
            }
        }
        Ok(())
    }

    /// Add a server parameter unless one with the same name is present.
    pub fn set_option_default(&mut self, key: &str, value: impl Into<String>) {
        if !self.options.iter().any(|(k, _)| k == key) {
            self.options.push((key.to_string(), value.into()));
        }
    }

    /// Server parameters rendered as a libpq `options` string.
    pub fn options_string(&self) -> Option<String> {
        if self.options.is_empty() {
            return None;
        }
        Some(
            self.options
                .iter()
                .map(|(k, v)| format!("-c {k}={}", v.replace('\\', "\\\\").replace(' ', "\\ ")))
                .collect::<Vec<_>>()
                .join(" "),
        )
    }
}

fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Split a keyword DSN into `(key, value)` pairs, honouring single quotes
/// and backslash escapes.
pub fn parse_keyword_dsn(dsn: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut pairs = Vec::new();
    let mut chars = dsn.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(ConfigError::Dsn(format!("missing '=' after '{key}'")));
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'\'') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => break,
                    },
                    '\'' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(ConfigError::Dsn(format!(
                    "unterminated quoted value for '{key}'"
                )));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                chars.next();
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                } else {
                    value.push(c);
                }
            }
        }

        if key.is_empty() {
            return Err(ConfigError::Dsn("empty key".to_string()));
        }
        pairs.push((key, value));
    }

    Ok(pairs)
}

/// Command line / environment configuration for the `pgbridge` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pgbridge",
    about = "Connect to PostgreSQL through one of the pgbridge drivers and report pool statistics",
    version,
    author
)]
pub struct CliArgs {
    /// Backend driver
    #[arg(long, value_enum, default_value = "wire", env = "PGBRIDGE_DRIVER")]
    pub driver: DriverKind,

    /// postgres:// URL overriding the individual connection flags
    #[arg(long, env = "PGBRIDGE_URL")]
    pub url: Option<String>,

    #[arg(long, default_value = DEFAULT_HOST, env = "PGBRIDGE_HOST")]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT, env = "PGBRIDGE_PORT")]
    pub port: u16,

    #[arg(long, default_value = DEFAULT_USER, env = "PGBRIDGE_USER")]
    pub user: String,

    #[arg(long, default_value = "", env = "PGBRIDGE_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(long, default_value = DEFAULT_DATABASE, env = "PGBRIDGE_DBNAME")]
    pub dbname: String,

    #[arg(long, value_enum, default_value = "disable", env = "PGBRIDGE_SSLMODE")]
    pub sslmode: SslMode,

    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS, env = "PGBRIDGE_MAX_CONNECTIONS")]
    pub max_connections: u32,

    #[arg(long, default_value_t = DEFAULT_MIN_CONNECTIONS, env = "PGBRIDGE_MIN_CONNECTIONS")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS, env = "PGBRIDGE_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Query timeout in seconds
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_SECS, env = "PGBRIDGE_QUERY_TIMEOUT")]
    pub query_timeout: u64,

    /// Tenant id; enables multi-tenant session tagging
    #[arg(long, env = "PGBRIDGE_TENANT")]
    pub tenant: Option<String>,

    /// Statement to execute once connected
    #[arg(long, env = "PGBRIDGE_EXEC")]
    pub exec: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PGBRIDGE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "PGBRIDGE_JSON_LOGS")]
    pub json_logs: bool,
}

impl CliArgs {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Build the provider configuration.
    pub fn to_config(&self) -> Config {
        let mut config = Config {
            driver: self.driver,
            url: self.url.clone(),
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.dbname.clone(),
            ssl_mode: self.sslmode,
            ..Config::default()
        };
        config.pool.max_connections = self.max_connections;
        config.pool.min_connections = self.min_connections;
        config.timeouts.connect = Duration::from_secs(self.connect_timeout);
        config.timeouts.query = Duration::from_secs(self.query_timeout);
        if self.tenant.is_some() {
            config = config.with_multi_tenant(true);
        }
        config
    }
}
