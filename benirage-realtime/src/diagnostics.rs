//! On-demand connection diagnostics.
//!
//! Each layer of the stack is probed independently:
//!
//! | Check       | Passes when                                         |
//! |-------------|-----------------------------------------------------|
//! | `network`   | a well-known host unrelated to the backend answers  |
//! | `dns`       | the backend host resolves                           |
//! | `api`       | the REST API answers (401/403 counts as reachable)  |
//! | `websocket` | the realtime WebSocket handshake completes          |
//! | `realtime`  | the connection manager reports `connected`          |
//! | `cookies`   | the HTTP cookie jar stores and returns a cookie     |
//! | `cors`      | a cross-origin preflight is answered                |
//!
//! Probes never abort each other: each runs under its own deadline and a
//! failing or panicking probe becomes a failed check with a detail string.
//! Diagnostics only read connection state, they never change it.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use futures_util::FutureExt;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::{BackendConfig, DiagnosticsConfig};
use crate::connection::ConnectionState;
use crate::error::TransportError;

/// Outcome of one probe: a detail string either way.
pub type ProbeResult = Result<String, String>;

/// The individual checks, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    Network,
    Dns,
    Api,
    Websocket,
    Realtime,
    Cookies,
    Cors,
}

impl Check {
    pub const ALL: [Check; 7] = [
        Check::Network,
        Check::Dns,
        Check::Api,
        Check::Websocket,
        Check::Realtime,
        Check::Cookies,
        Check::Cors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Check::Network => "network",
            Check::Dns => "dns",
            Check::Api => "api",
            Check::Websocket => "websocket",
            Check::Realtime => "realtime",
            Check::Cookies => "cookies",
            Check::Cors => "cors",
        }
    }

    fn recommendation(&self) -> &'static str {
        match self {
            Check::Network => "Check your internet connection or Wi-Fi network.",
            Check::Dns => {
                "The server address could not be resolved. Check your DNS settings or try another network."
            }
            Check::Api => "The backend API is unreachable. The service may be down, try again later.",
            Check::Websocket => {
                "Realtime connections are blocked. A firewall, proxy or VPN may be blocking WebSockets."
            }
            Check::Realtime => "Realtime updates are not connected. Use Retry to reconnect.",
            Check::Cookies => "Cookies cannot be stored. Allow cookies for this site.",
            Check::Cors => "Cross-origin requests are rejected. Contact support if this persists.",
        }
    }
}

impl std::fmt::Display for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub check: Check,
    pub passed: bool,
    pub detail: String,
    pub elapsed_ms: u64,
}

/// Overall health derived from the share of passed checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// ≥ 80 % healthy, ≥ 50 % degraded, otherwise unhealthy.
    pub fn from_ratio(passed: usize, total: usize) -> Self {
        if total == 0 {
            return HealthStatus::Unhealthy;
        }
        // Integer comparison avoids float rounding at the boundaries
        if passed * 100 >= total * 80 {
            HealthStatus::Healthy
        } else if passed * 100 >= total * 50 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Snapshot produced by [`Diagnostics::run_diagnostics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticResult {
    pub checks: Vec<CheckResult>,
    pub passed: usize,
    pub total: usize,
    pub health_percent: u8,
    pub overall: HealthStatus,
    pub recommendations: Vec<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl DiagnosticResult {
    fn from_checks(checks: Vec<CheckResult>) -> Self {
        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();
        let health_percent = if total == 0 {
            0
        } else {
            (passed * 100 / total) as u8
        };

        let mut recommendations: Vec<String> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.check.recommendation().to_string())
            .collect();
        if recommendations.is_empty() {
            recommendations.push("All systems operational.".to_string());
        }

        Self {
            passed,
            total,
            health_percent,
            overall: HealthStatus::from_ratio(passed, total),
            recommendations,
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            checks,
        }
    }

    pub fn get(&self, check: Check) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.check == check)
    }

    pub fn passed(&self, check: Check) -> bool {
        self.get(check).is_some_and(|c| c.passed)
    }
}

/// Speed classification of [`Diagnostics::test_network_speed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedRating {
    Fast,
    Moderate,
    Slow,
    Unreachable,
}

impl SpeedRating {
    pub fn from_latency(latency: Duration) -> Self {
        match latency.as_millis() {
            0..300 => SpeedRating::Fast,
            300..1000 => SpeedRating::Moderate,
            _ => SpeedRating::Slow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSpeed {
    pub latency_ms: Option<u64>,
    pub rating: SpeedRating,
}

/// Network operations behind each check.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn reachability(&self) -> ProbeResult;
    async fn resolve_backend(&self) -> ProbeResult;
    async fn api(&self) -> ProbeResult;
    async fn websocket(&self) -> ProbeResult;
    async fn cookies(&self) -> ProbeResult;
    async fn cors(&self) -> ProbeResult;
    /// Fetch a small resource; used for latency measurement.
    async fn fetch_small(&self) -> ProbeResult;
}

/// Runs the probes and aggregates a report.
pub struct Diagnostics<P: NetworkProbe> {
    probe: P,
    config: DiagnosticsConfig,
    connection: Option<watch::Receiver<ConnectionState>>,
}

impl<P: NetworkProbe> Diagnostics<P> {
    pub fn new(probe: P, config: DiagnosticsConfig) -> Self {
        Self {
            probe,
            config,
            connection: None,
        }
    }

    /// Report on a connection manager's state (see
    /// [`crate::ConnectionManager::watch_state`]).
    pub fn with_connection(mut self, state: watch::Receiver<ConnectionState>) -> Self {
        self.connection = Some(state);
        self
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Run every check. Never fails.
    pub async fn run_diagnostics(&self) -> DiagnosticResult {
        log::info!("Running connection diagnostics");
        let (network, dns, api, websocket, cookies, cors) = tokio::join!(
            self.guarded(Check::Network, self.probe.reachability()),
            self.guarded(Check::Dns, self.probe.resolve_backend()),
            self.guarded(Check::Api, self.probe.api()),
            self.guarded(Check::Websocket, self.probe.websocket()),
            self.guarded(Check::Cookies, self.probe.cookies()),
            self.guarded(Check::Cors, self.probe.cors()),
        );
        let realtime = self.realtime_check();

        let result =
            DiagnosticResult::from_checks(vec![network, dns, api, websocket, realtime, cookies, cors]);
        for check in result.checks.iter().filter(|c| !c.passed) {
            log::warn!("Diagnostic check {} failed: {}", check.check, check.detail);
        }
        log::info!(
            "Diagnostics: {}/{} checks passed ({:?})",
            result.passed,
            result.total,
            result.overall
        );
        result
    }

    /// Single backend reachability probe.
    pub async fn quick_connectivity_test(&self) -> bool {
        self.guarded(Check::Api, self.probe.api()).await.passed
    }

    /// Time a small fetch and rate the latency.
    pub async fn test_network_speed(&self) -> NetworkSpeed {
        let result = self.guarded(Check::Network, self.probe.fetch_small()).await;
        if !result.passed {
            log::debug!("Speed test failed: {}", result.detail);
            return NetworkSpeed {
                latency_ms: None,
                rating: SpeedRating::Unreachable,
            };
        }
        NetworkSpeed {
            latency_ms: Some(result.elapsed_ms),
            rating: SpeedRating::from_latency(Duration::from_millis(result.elapsed_ms)),
        }
    }

    fn realtime_check(&self) -> CheckResult {
        let (passed, detail) = match &self.connection {
            Some(state) => {
                let state = *state.borrow();
                (state == ConnectionState::Connected, format!("state: {state}"))
            }
            None => (false, "no realtime connection attached".to_string()),
        };
        CheckResult {
            check: Check::Realtime,
            passed,
            detail,
            elapsed_ms: 0,
        }
    }

    async fn guarded<F>(&self, check: Check, probe: F) -> CheckResult
    where
        F: std::future::Future<Output = ProbeResult>,
    {
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.probe_timeout,
            AssertUnwindSafe(probe).catch_unwind(),
        )
        .await;
        let (passed, detail) = match outcome {
            Ok(Ok(Ok(detail))) => (true, detail),
            Ok(Ok(Err(detail))) => (false, detail),
            Ok(Err(_)) => (false, "probe panicked".to_string()),
            Err(_) => (
                false,
                format!("timed out after {}ms", self.config.probe_timeout.as_millis()),
            ),
        };
        CheckResult {
            check,
            passed,
            detail,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Probes against the real backend over HTTP and WebSocket.
pub struct HttpProbe {
    backend: BackendConfig,
    config: DiagnosticsConfig,
    http: reqwest::Client,
}

impl HttpProbe {
    pub fn new(backend: BackendConfig, config: DiagnosticsConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()?;
        Ok(Self {
            backend,
            config,
            http,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.backend.anon_key)
            .bearer_auth(&self.backend.anon_key)
    }
}

#[async_trait]
impl NetworkProbe for HttpProbe {
    async fn reachability(&self) -> ProbeResult {
        let response = self
            .http
            .get(&self.config.reachability_url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("HTTP {}", response.status().as_u16()))
    }

    async fn resolve_backend(&self) -> ProbeResult {
        let host = self.backend.socket_host();
        let addrs: Vec<_> = tokio::net::lookup_host(host.as_str())
            .await
            .map_err(|e| format!("{host}: {e}"))?
            .collect();
        match addrs.first() {
            Some(addr) => Ok(format!("{host} -> {} ({} address(es))", addr.ip(), addrs.len())),
            None => Err(format!("{host}: no addresses")),
        }
    }

    async fn api(&self) -> ProbeResult {
        let url = self.backend.rest_url(&self.backend.probe_table);
        let response = self
            .authorized(self.http.get(url))
            .query(&[("select", "*"), ("limit", "1")])
            .send()
            .await
            .map_err(|e| TransportError::from(e).to_string())?;
        let status = response.status();
        match status {
            s if s.is_success() => Ok(format!("HTTP {}", s.as_u16())),
            // Reachable, just not allowed
            s if s == StatusCode::UNAUTHORIZED || s == StatusCode::FORBIDDEN => {
                Ok(format!("reachable, unauthorized (HTTP {})", status.as_u16()))
            }
            s => Err(TransportError::from_status(s.as_u16(), "").to_string()),
        }
    }

    async fn websocket(&self) -> ProbeResult {
        let (mut stream, response) =
            tokio_tungstenite::connect_async(self.backend.realtime_url().as_str())
                .await
                .map_err(|e| TransportError::from(e).to_string())?;
        if let Err(e) = stream.close(None).await {
            log::debug!("Closing diagnostics websocket failed: {e}");
        }
        Ok(format!("handshake ok (HTTP {})", response.status().as_u16()))
    }

    async fn cookies(&self) -> ProbeResult {
        let url = Url::parse(&self.backend.url).map_err(|e| e.to_string())?;
        let jar = Jar::default();
        jar.add_cookie_str("benirage_diagnostics=1; Path=/", &url);
        match jar.cookies(&url) {
            Some(header) if header.to_str().is_ok_and(|v| v.contains("benirage_diagnostics=1")) => {
                Ok("cookie stored and read back".to_string())
            }
            _ => Err(TransportError::cookie("cookie was not stored").to_string()),
        }
    }

    async fn cors(&self) -> ProbeResult {
        let url = self.backend.rest_url(&self.backend.probe_table);
        let response = self
            .http
            .request(Method::OPTIONS, url)
            .header("Origin", &self.config.cors_origin)
            .header("Access-Control-Request-Method", "GET")
            .header("Access-Control-Request-Headers", "apikey, authorization")
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let allowed = response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match allowed {
            Some(origin) => Ok(format!("allowed origin: {origin}")),
            None if response.status().is_success() => {
                Ok(format!("HTTP {}", response.status().as_u16()))
            }
            None => Err(format!("preflight rejected (HTTP {})", response.status().as_u16())),
        }
    }

    async fn fetch_small(&self) -> ProbeResult {
        let url = self
            .config
            .speed_test_url
            .clone()
            .unwrap_or_else(|| self.backend.health_url());
        let response = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        // Latency covers the whole body, not just the headers
        let body = response
            .bytes()
            .await
            .map_err(|e| format!("reading body failed: {}", TransportError::from(e)))?;
        Ok(format!("HTTP {status}, {} bytes", body.len()))
    }
}
