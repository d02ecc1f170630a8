use super::{
    ContainerIdentity, ContainerInfo, ContainerProvider, ContainerStatus, ProviderKind,
    WATCH_BUFFER,
};
use crate::error::ProviderError;
use crate::events::{Action, ContainerEvent, WatchMessage};
use crate::task::{Cause, Task};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-request timeout against the Proxmox API
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval while waiting for an LXC action to take effect
pub const ACTION_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Poll interval of the status watch
pub const STATE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Connection settings for a Proxmox VE cluster
#[derive(Debug, Clone, Deserialize)]
pub struct ProxmoxSettings {
    /// API base, e.g. `https://pve.lan:8006`
    pub url: String,
    /// API token id, e.g. `root@pam!napgate`
    pub token_id: String,
    pub secret: String,
    /// Accept self-signed certificates
    #[serde(default)]
    pub no_tls_verify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LxcAction {
    Start,
    Shutdown,
    Suspend,
    Resume,
}

impl LxcAction {
    fn as_str(&self) -> &'static str {
        match self {
            LxcAction::Start => "start",
            LxcAction::Shutdown => "shutdown",
            LxcAction::Suspend => "suspend",
            LxcAction::Resume => "resume",
        }
    }

    fn target(&self) -> ContainerStatus {
        match self {
            LxcAction::Start | LxcAction::Resume => ContainerStatus::Running,
            LxcAction::Shutdown => ContainerStatus::Stopped,
            LxcAction::Suspend => ContainerStatus::Paused,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct LxcCurrent {
    status: String,
    #[serde(default)]
    name: String,
}

fn map_status(status: &str) -> Result<ContainerStatus, ProviderError> {
    match status {
        "running" => Ok(ContainerStatus::Running),
        "stopped" => Ok(ContainerStatus::Stopped),
        "suspended" => Ok(ContainerStatus::Paused),
        other => Err(ProviderError::UnexpectedStatus(other.to_string())),
    }
}

/// Lifecycle calls against one LXC container on a Proxmox node.
///
/// Stop and kill both map to an LXC shutdown; signals do not apply.
#[derive(Clone)]
pub struct ProxmoxProvider {
    http: reqwest::Client,
    base: String,
    auth: String,
    node: String,
    vmid: u64,
}

impl ProxmoxProvider {
    pub fn new(settings: &ProxmoxSettings, node: &str, vmid: u64) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(settings.no_tls_verify)
            .build()?;
        Ok(Self {
            http,
            base: settings.url.trim_end_matches('/').to_string(),
            auth: format!("PVEAPIToken={}={}", settings.token_id, settings.secret),
            node: node.to_string(),
            vmid,
        })
    }

    fn lxc_url(&self, suffix: &str) -> String {
        format!(
            "{}/api2/json/nodes/{}/lxc/{}/{}",
            self.base, self.node, self.vmid, suffix
        )
    }

    async fn current(&self) -> Result<LxcCurrent, ProviderError> {
        let response = self
            .http
            .get(self.lxc_url("status/current"))
            .header("Authorization", &self.auth)
            .send()
            .await?
            .error_for_status()?
            .json::<ApiResponse<LxcCurrent>>()
            .await?;
        Ok(response.data)
    }

    async fn status(&self) -> Result<ContainerStatus, ProviderError> {
        map_status(&self.current().await?.status)
    }

    /// Issue an action and wait until the container reaches its target
    /// status. Bounded by the caller.
    async fn action(&self, action: LxcAction) -> Result<(), ProviderError> {
        self.http
            .post(self.lxc_url(&format!("status/{}", action.as_str())))
            .header("Authorization", &self.auth)
            .send()
            .await?
            .error_for_status()?;

        let target = action.target();
        loop {
            tokio::time::sleep(ACTION_POLL_INTERVAL).await;
            if self.status().await? == target {
                info!(node = %self.node, vmid = self.vmid, action = action.as_str(), "LXC action done");
                return Ok(());
            }
        }
    }
}

async fn watch_status(
    provider: ProxmoxProvider,
    name: String,
    tx: mpsc::Sender<WatchMessage>,
    task: Task,
) {
    let mut running = None;
    let mut interval = tokio::time::interval(STATE_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = task.cancelled() => break,
            _ = interval.tick() => {
                let message = match provider.status().await {
                    Ok(status) => {
                        let now = status == ContainerStatus::Running;
                        let changed = running.is_some_and(|was| was != now);
                        running = Some(now);
                        if !changed {
                            continue;
                        }
                        WatchMessage::Event(ContainerEvent {
                            action: if now { Action::Start } else { Action::Stop },
                            actor_id: provider.vmid.to_string(),
                            actor_name: name.clone(),
                        })
                    }
                    Err(e) => {
                        warn!(task = %task, error = %e, "LXC status poll failed");
                        WatchMessage::Error(e)
                    }
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        }
    }

    task.finish(task.finish_cause().unwrap_or(Cause::Canceled)).await;
}

impl ContainerProvider for ProxmoxProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Proxmox
    }

    fn inspect<'a>(
        &'a self,
        _identity: &'a ContainerIdentity,
    ) -> BoxFuture<'a, Result<ContainerInfo, ProviderError>> {
        Box::pin(async move {
            let current = self.current().await?;
            Ok(ContainerInfo {
                id: self.vmid.to_string(),
                status: map_status(&current.status)?,
                name: current.name,
            })
        })
    }

    fn start<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(self.action(LxcAction::Start))
    }

    fn stop<'a>(
        &'a self,
        _id: &'a str,
        _signal: Option<&'a str>,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(self.action(LxcAction::Shutdown))
    }

    fn pause<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(self.action(LxcAction::Suspend))
    }

    fn unpause<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(self.action(LxcAction::Resume))
    }

    fn kill<'a>(
        &'a self,
        _id: &'a str,
        _signal: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(self.action(LxcAction::Shutdown))
    }

    fn watch(&self, identity: &ContainerIdentity, task: Task) -> mpsc::Receiver<WatchMessage> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        debug!(node = %self.node, vmid = self.vmid, "watching LXC status");
        tokio::spawn(watch_status(self.clone(), identity.name.clone(), tx, task));
        rx
    }

    fn close(&self) {}
}
