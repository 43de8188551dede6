//! Configuration for the resilience layer.
//!
//! Every tunable has a production default; `for_testing()` presets shrink
//! timeouts so suites run fast on paused tokio time.

use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVar(String),
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

/// Where the backend lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Project base URL, e.g. `https://abc.supabase.co`
    pub url: String,
    /// Public anon key sent as `apikey` and bearer token
    pub anon_key: String,
    /// Postgres schema for change subscriptions
    pub schema: String,
    /// Table read by the connectivity probe
    pub probe_table: String,
    /// Deadline for a single HTTP request
    pub request_timeout: Duration,
    /// How long a channel join may wait for its reply
    pub join_timeout: Duration,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Result<Self, ConfigError> {
        let url = url.into().trim_end_matches('/').to_string();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(url));
        }
        Ok(Self {
            url,
            anon_key: anon_key.into(),
            schema: "public".to_string(),
            probe_table: "profiles".to_string(),
            request_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
        })
    }

    /// Read `SUPABASE_URL` / `SUPABASE_ANON_KEY` (or their `VITE_` prefixed
    /// forms). `SUPABASE_PROBE_TABLE` optionally overrides the probe table.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = env_any(&["SUPABASE_URL", "VITE_SUPABASE_URL"])
            .ok_or_else(|| ConfigError::MissingVar("SUPABASE_URL".to_string()))?;
        let key = env_any(&["SUPABASE_ANON_KEY", "VITE_SUPABASE_ANON_KEY"])
            .ok_or_else(|| ConfigError::MissingVar("SUPABASE_ANON_KEY".to_string()))?;
        let mut config = Self::new(url, key)?;
        if let Some(table) = env_any(&["SUPABASE_PROBE_TABLE"]) {
            config.probe_table = table;
        }
        Ok(config)
    }

    /// Host (and port, if any) of the backend URL.
    pub fn host(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        rest.split('/').next().unwrap_or(rest)
    }

    /// `host:port` pair suitable for DNS resolution.
    pub fn socket_host(&self) -> String {
        let host = self.host();
        if host.contains(':') {
            host.to_string()
        } else if self.url.starts_with("https://") {
            format!("{host}:443")
        } else {
            format!("{host}:80")
        }
    }

    /// Realtime WebSocket endpoint.
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.url.clone()
        };
        format!(
            "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.anon_key
        )
    }

    /// REST endpoint for a table.
    pub fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.url)
    }

    /// Lightweight health endpoint of the auth service.
    pub fn health_url(&self) -> String {
        format!("{}/auth/v1/health", self.url)
    }
}

fn env_any(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

/// Reconnection and liveness tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Automatic reconnect attempts before giving up. Default: 5.
    pub max_reconnect_attempts: u32,
    /// First backoff delay. Default: 1s.
    pub base_delay: Duration,
    /// Backoff ceiling. Default: 30s.
    pub max_delay: Duration,
    /// Heartbeat period while connected. Default: 30s.
    pub heartbeat_interval: Duration,
    /// Health-check (probe) period while connected. Default: 60s.
    pub health_check_interval: Duration,
    /// Deadline for the connectivity probe. Default: 10s.
    pub connect_timeout: Duration,
    /// Delay before re-joining a timed-out channel. Default: 5s.
    pub resubscribe_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            heartbeat_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Same shape as production, shorter connect deadline.
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Diagnostics probe targets.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Well-known host unrelated to the backend
    pub reachability_url: String,
    /// Resource fetched by the speed test (None = backend health endpoint)
    pub speed_test_url: Option<String>,
    /// Origin sent with the CORS preflight
    pub cors_origin: String,
    /// Deadline for each individual probe
    pub probe_timeout: Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            reachability_url: "https://www.google.com/generate_204".to_string(),
            speed_test_url: None,
            cors_origin: "https://benirage.org".to_string(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl DiagnosticsConfig {
    pub fn for_testing() -> Self {
        Self {
            reachability_url: "http://127.0.0.1:9/".to_string(),
            probe_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }
}
