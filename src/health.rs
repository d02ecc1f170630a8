//! Backend health probes
//!
//! Idle watchers probe their backend after a wake to decide when it is ready.
//! Three probes exist, picked once when the watcher is built:
//! - [`HttpHealthChecker`]: HEAD (or GET) request over http or https, 5xx
//!   is unhealthy
//! - [`RawHealthChecker`]: TCP connect for stream routes
//! - [`AgentHealthChecker`]: asks a remote agent to probe on our behalf
//!
//! An unreachable backend is an unhealthy result, not an error. Errors are
//! reserved for probes that could not be carried out at all.

use crate::error::HealthError;
use futures::future::BoxFuture;
use reqwest::Url;
use serde::{Deserialize, Serialize, Serializer};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Probe timeout used by idle watchers
pub const WAKE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Health check configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckConfig {
    /// Path for HTTP probes
    pub path: String,
    /// Use GET instead of HEAD
    pub use_get: bool,
    #[serde(rename = "timeout_ms", serialize_with = "serialize_millis")]
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            use_get: false,
            timeout: WAKE_PROBE_TIMEOUT,
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub detail: String,
}

impl HealthCheckResult {
    fn healthy(started: Instant) -> Self {
        Self {
            healthy: true,
            latency_ms: started.elapsed().as_millis() as u64,
            detail: String::new(),
        }
    }

    fn unhealthy(started: Instant, detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: started.elapsed().as_millis() as u64,
            detail: detail.into(),
        }
    }
}

/// Status reported for a backend on the admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Napping,
    Starting,
    Unhealthy,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Napping => "napping",
            HealthStatus::Starting => "starting",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Error => "error",
        }
    }
}

/// Probes a single backend.
pub trait HealthChecker: Send + Sync {
    fn check_health(&self) -> BoxFuture<'_, Result<HealthCheckResult, HealthError>>;

    /// The backend address being probed
    fn url(&self) -> &Url;

    fn config(&self) -> &HealthCheckConfig;
}

/// Pick the probe for a backend: relayed through `agent` when set, HTTP for
/// http(s) targets and a TCP connect otherwise.
pub fn checker_for(
    target: &Url,
    agent: Option<&Url>,
    config: HealthCheckConfig,
) -> Arc<dyn HealthChecker> {
    match agent {
        Some(agent) => Arc::new(AgentHealthChecker::new(agent.clone(), target.clone(), config)),
        None if matches!(target.scheme(), "http" | "https") => {
            Arc::new(HttpHealthChecker::new(target.clone(), config))
        }
        None => Arc::new(RawHealthChecker::new(target.clone(), config)),
    }
}

fn host_port(url: &Url) -> Result<String, HealthError> {
    let host = url
        .host_str()
        .ok_or_else(|| HealthError::InvalidUrl(url.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| HealthError::InvalidUrl(url.to_string()))?;
    Ok(format!("{}:{}", host, port))
}

/// HEAD or GET probe over http or https. Certificates are not verified
/// and redirects are not followed.
pub struct HttpHealthChecker {
    url: Url,
    config: HealthCheckConfig,
    http: reqwest::Client,
}

impl HttpHealthChecker {
    pub fn new(url: Url, config: HealthCheckConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .user_agent(concat!("napgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { url, config, http }
    }

    fn probe_url(&self) -> Result<Url, HealthError> {
        self.url
            .join(&self.config.path)
            .map_err(|e| HealthError::InvalidUrl(format!("{}{}: {}", self.url, self.config.path, e)))
    }
}

impl HealthChecker for HttpHealthChecker {
    fn check_health(&self) -> BoxFuture<'_, Result<HealthCheckResult, HealthError>> {
        Box::pin(async move {
            let url = self.probe_url()?;
            let request = if self.config.use_get {
                self.http.get(url)
            } else {
                self.http.head(url)
            };

            let started = Instant::now();
            let response = request
                .header(reqwest::header::ACCEPT, "text/plain,text/html,*/*;q=0.8")
                .header(reqwest::header::CACHE_CONTROL, "no-cache")
                .send()
                .await;

            Ok(match response {
                Ok(response) if response.status().is_server_error() => {
                    debug!(url = %self.url, status = %response.status(), "Health check failed (server error)");
                    HealthCheckResult::unhealthy(started, format!("HTTP {}", response.status()))
                }
                Ok(_) => HealthCheckResult::healthy(started),
                Err(e) if e.is_timeout() => {
                    debug!(url = %self.url, "Health check failed (timeout)");
                    HealthCheckResult::unhealthy(started, "timeout")
                }
                Err(e) => {
                    debug!(url = %self.url, error = %e, "Health check failed (request error)");
                    HealthCheckResult::unhealthy(started, e.to_string())
                }
            })
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn config(&self) -> &HealthCheckConfig {
        &self.config
    }
}

/// TCP connect probe.
pub struct RawHealthChecker {
    url: Url,
    config: HealthCheckConfig,
}

impl RawHealthChecker {
    pub fn new(url: Url, config: HealthCheckConfig) -> Self {
        Self { url, config }
    }
}

impl HealthChecker for RawHealthChecker {
    fn check_health(&self) -> BoxFuture<'_, Result<HealthCheckResult, HealthError>> {
        Box::pin(async move {
            let started = Instant::now();
            let addr = host_port(&self.url)?;

            match tokio::time::timeout(self.config.timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(_stream)) => {
                    debug!(addr, "Health check passed (TCP connect)");
                    Ok(HealthCheckResult::healthy(started))
                }
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionRefused
                            | ErrorKind::ConnectionReset
                            | ErrorKind::ConnectionAborted
                            | ErrorKind::TimedOut
                    ) =>
                {
                    debug!(addr, error = %e, "Health check failed (connection error)");
                    Ok(HealthCheckResult::unhealthy(started, e.to_string()))
                }
                Ok(Err(e)) => Err(HealthError::Io(e)),
                Err(_) => Ok(HealthCheckResult::unhealthy(started, "timeout")),
            }
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn config(&self) -> &HealthCheckConfig {
        &self.config
    }
}

/// Probe relayed through a remote agent's `/v1/health` endpoint.
pub struct AgentHealthChecker {
    agent: Url,
    url: Url,
    config: HealthCheckConfig,
    http: reqwest::Client,
}

impl AgentHealthChecker {
    pub fn new(agent: Url, url: Url, config: HealthCheckConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            agent,
            url,
            config,
            http,
        }
    }

    fn relay_url(&self) -> Result<String, HealthError> {
        let host = host_port(&self.url)?;
        Ok(format!(
            "{}/v1/health?scheme={}&host={}&path={}",
            self.agent.as_str().trim_end_matches('/'),
            urlencoding::encode(self.url.scheme()),
            urlencoding::encode(&host),
            urlencoding::encode(&self.config.path),
        ))
    }
}

impl HealthChecker for AgentHealthChecker {
    fn check_health(&self) -> BoxFuture<'_, Result<HealthCheckResult, HealthError>> {
        Box::pin(async move {
            let url = self.relay_url()?;
            let result = self
                .http
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<HealthCheckResult>()
                .await?;
            Ok(result)
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn config(&self) -> &HealthCheckConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!("{}\r\nContent-Length: 0\r\n\r\n", status_line);
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_http_ok_is_healthy() {
        let port = serve_once("HTTP/1.1 200 OK").await;
        let checker = HttpHealthChecker::new(
            url(&format!("http://127.0.0.1:{}", port)),
            HealthCheckConfig::default(),
        );
        let result = checker.check_health().await.unwrap();
        assert!(result.healthy);
    }

    #[tokio::test]
    async fn test_http_404_is_healthy() {
        let port = serve_once("HTTP/1.1 404 Not Found").await;
        let checker = HttpHealthChecker::new(
            url(&format!("http://127.0.0.1:{}", port)),
            HealthCheckConfig::default(),
        );
        assert!(checker.check_health().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_http_5xx_is_unhealthy() {
        let port = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let checker = HttpHealthChecker::new(
            url(&format!("http://127.0.0.1:{}", port)),
            HealthCheckConfig::default(),
        );
        let result = checker.check_health().await.unwrap();
        assert!(!result.healthy);
        assert!(result.detail.contains("503"));
    }

    #[tokio::test]
    async fn test_http_refused_is_unhealthy() {
        let port = closed_port().await;
        let checker = HttpHealthChecker::new(
            url(&format!("http://127.0.0.1:{}", port)),
            HealthCheckConfig::default(),
        );
        let result = checker.check_health().await.unwrap();
        assert!(!result.healthy);
        assert!(!result.detail.is_empty());
    }

    #[tokio::test]
    async fn test_https_target_speaks_tls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let first_byte = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            stream.read_exact(&mut buf).await.unwrap();
            buf[0]
        });

        let checker = HttpHealthChecker::new(
            url(&format!("https://127.0.0.1:{}", port)),
            HealthCheckConfig::default(),
        );
        let result = checker.check_health().await.unwrap();

        // TLS handshake record, not a plaintext request line
        assert_eq!(first_byte.await.unwrap(), 0x16);
        assert!(!result.healthy);
    }

    #[tokio::test]
    async fn test_http_get_uses_configured_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let request_line = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let _ = stream
                .write_all(b"HTTP/1.1 302 Found\r\nLocation: /login\r\nContent-Length: 0\r\n\r\n")
                .await;
            String::from_utf8_lossy(&buf[..n]).lines().next().unwrap_or_default().to_string()
        });

        let checker = HttpHealthChecker::new(
            url(&format!("http://127.0.0.1:{}", port)),
            HealthCheckConfig {
                path: "/healthz".to_string(),
                use_get: true,
                ..Default::default()
            },
        );
        let result = checker.check_health().await.unwrap();

        assert!(result.healthy);
        assert_eq!(request_line.await.unwrap(), "GET /healthz HTTP/1.1");
    }

    #[tokio::test]
    async fn test_raw_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let checker = RawHealthChecker::new(
            url(&format!("tcp://127.0.0.1:{}", port)),
            HealthCheckConfig::default(),
        );
        assert!(checker.check_health().await.unwrap().healthy);

        drop(listener);
        assert!(!checker.check_health().await.unwrap().healthy);
    }

    #[test]
    fn test_checker_selection() {
        let config = HealthCheckConfig::default();
        let http = checker_for(&url("http://app:8080"), None, config.clone());
        assert_eq!(http.url().scheme(), "http");

        let agent = url("http://agent:8890");
        let relayed = AgentHealthChecker::new(agent, url("http://app:8080"), config);
        assert_eq!(
            relayed.relay_url().unwrap(),
            "http://agent:8890/v1/health?scheme=http&host=app%3A8080&path=%2F"
        );
    }

    #[test]
    fn test_health_status_serializes_lowercase() {
        let json = serde_json::to_string(&HealthStatus::Napping).unwrap();
        assert_eq!(json, "\"napping\"");
    }

    #[test]
    fn test_invalid_url() {
        let err = host_port(&url("unix:/var/run/app.sock")).unwrap_err();
        assert!(matches!(err, HealthError::InvalidUrl(_)));
    }
}
