use crate::error::WatcherError;
use crate::health::{HealthCheckConfig, HealthStatus};
use crate::provider::ProviderKind;
use reqwest::Url;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// What to do with a container once its idle timer expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMethod {
    #[default]
    Stop,
    Pause,
    Kill,
}

impl StopMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopMethod::Stop => "stop",
            StopMethod::Pause => "pause",
            StopMethod::Kill => "kill",
        }
    }
}

impl fmt::Display for StopMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idle lifecycle settings of one watcher. Replaced in place when the route
/// is registered again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdleSettings {
    /// Zero never arms the idle timer
    #[serde(rename = "idle_timeout_secs", serialize_with = "serialize_secs")]
    pub idle_timeout: Duration,
    #[serde(rename = "wake_timeout_secs", serialize_with = "serialize_secs")]
    pub wake_timeout: Duration,
    pub stop_method: StopMethod,
    #[serde(rename = "stop_timeout_secs", serialize_with = "serialize_secs")]
    pub stop_timeout: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::ZERO,
            wake_timeout: Duration::from_secs(30),
            stop_method: StopMethod::Stop,
            stop_timeout: Duration::from_secs(10),
            stop_signal: None,
        }
    }
}

/// Where requests for the route are forwarded once the backend is awake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyTarget {
    ReverseProxy(Url),
    Stream(Url),
}

impl ProxyTarget {
    pub fn url(&self) -> &Url {
        match self {
            ProxyTarget::ReverseProxy(url) | ProxyTarget::Stream(url) => url,
        }
    }

    /// The address is not known until the container has been inspected
    /// with a published port.
    pub fn is_resolved(&self) -> bool {
        self.url().port() != Some(0)
    }
}

/// Lifecycle state owned by the watcher's event loop and published to
/// readers through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerState {
    pub running: bool,
    /// The last probe since the container started succeeded
    pub ready: bool,
    /// Last failed probe or lifecycle call
    pub error: Option<String>,
    /// When the idle timer fires, if armed
    pub idle_deadline: Option<Instant>,
}

impl ContainerState {
    pub(crate) fn observed(running: bool) -> Self {
        Self {
            running,
            ..Default::default()
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.error.is_some() {
            HealthStatus::Error
        } else if self.ready {
            HealthStatus::Healthy
        } else if self.running {
            HealthStatus::Starting
        } else {
            HealthStatus::Napping
        }
    }

    /// Seen starting. A container already known to be running keeps its
    /// readiness.
    pub(crate) fn set_starting(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.ready = false;
        self.error = None;
    }

    pub(crate) fn set_napping(&mut self) {
        self.running = false;
        self.ready = false;
        self.error = None;
        self.idle_deadline = None;
    }
}

/// Requests from callers to the event loop
#[derive(Debug)]
pub(crate) enum Command {
    /// Traffic reached a running container; push the idle deadline back
    Touch,
    /// The container was started or unpaused by `wake`
    Woke(oneshot::Sender<()>),
    /// A lifecycle call made by `wake` failed
    Failed(String),
    /// Result of a probe made by `status`
    Probed(Result<bool, String>),
    /// Settings were replaced by a new registration
    Rearm,
    /// A dependent went to sleep; stop now
    Stop(oneshot::Sender<Result<(), WatcherError>>),
}

/// Admin API view of a watcher
#[derive(Debug, Clone, Serialize)]
pub struct WatcherSnapshot {
    pub name: String,
    pub container_id: String,
    pub provider: ProviderKind,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub health: HealthCheckConfig,
    pub idle: IdleSettings,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
    /// Seconds until the idle timer fires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}
