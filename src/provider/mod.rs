//! Container lifecycle providers
//!
//! A provider issues lifecycle calls for one kind of backend container and
//! streams its lifecycle events. The variant is chosen once when a watcher is
//! built and never switched afterwards.

mod docker;
mod proxmox;

pub use docker::DockerProvider;
pub use proxmox::{ProxmoxProvider, ProxmoxSettings};

use crate::error::ProviderError;
use crate::events::WatchMessage;
use crate::task::Task;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Buffer of a provider watch channel
pub const WATCH_BUFFER: usize = 16;

/// Which provider backs a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local or TCP docker daemon
    #[default]
    Docker,
    /// Docker daemon relayed by a remote agent
    Agent,
    /// Proxmox LXC container
    Proxmox,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Docker => "docker",
            ProviderKind::Agent => "agent",
            ProviderKind::Proxmox => "proxmox",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container id and name. Either may change over the container's life
/// (rename, recreate) and is swapped in place by the watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerIdentity {
    pub id: String,
    pub name: String,
}

impl ContainerIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Id when known, name otherwise
    pub fn reference(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }
}

impl fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            f.write_str(&self.id)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Observed container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Paused,
    Stopped,
}

/// Result of an inspect call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
}

impl ContainerInfo {
    pub fn identity(&self) -> ContainerIdentity {
        ContainerIdentity::new(self.id.clone(), self.name.clone())
    }
}

/// Lifecycle calls against one kind of container backend.
///
/// Calls are not bounded internally; callers wrap them in their own timeout.
pub trait ContainerProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn inspect<'a>(
        &'a self,
        identity: &'a ContainerIdentity,
    ) -> BoxFuture<'a, Result<ContainerInfo, ProviderError>>;

    fn start<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ProviderError>>;

    /// Stop gracefully: send `signal` (the container default when `None`),
    /// then kill after `timeout`.
    fn stop<'a>(
        &'a self,
        id: &'a str,
        signal: Option<&'a str>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), ProviderError>>;

    fn pause<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ProviderError>>;

    fn unpause<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ProviderError>>;

    fn kill<'a>(
        &'a self,
        id: &'a str,
        signal: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ProviderError>>;

    /// Stream lifecycle events for `identity` until `task` is cancelled.
    ///
    /// The provider finishes `task` when the stream ends; the channel closes
    /// only after that.
    fn watch(&self, identity: &ContainerIdentity, task: Task) -> mpsc::Receiver<WatchMessage>;

    /// Release shared resources held by the provider
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_reference_prefers_id() {
        let identity = ContainerIdentity::new("abc123", "whoami");
        assert_eq!(identity.reference(), "abc123");
        assert_eq!(identity.to_string(), "whoami");

        let by_name = ContainerIdentity::new("", "whoami");
        assert_eq!(by_name.reference(), "whoami");
    }

    #[test]
    fn test_provider_kind_parses_lowercase() {
        let kind: ProviderKind = serde_json::from_str("\"proxmox\"").unwrap();
        assert_eq!(kind, ProviderKind::Proxmox);
        assert_eq!(ProviderKind::Agent.to_string(), "agent");
    }
}
