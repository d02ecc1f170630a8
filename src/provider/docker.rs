use super::{
    ContainerIdentity, ContainerInfo, ContainerProvider, ContainerStatus, ProviderKind,
    WATCH_BUFFER,
};
use crate::docker::SharedDockerClient;
use crate::error::ProviderError;
use crate::events::{Action, ContainerEvent, WatchMessage};
use crate::task::{Cause, Task};
use bollard::container::{
    InspectContainerOptions, KillContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delay between daemon pings while the event stream is down
pub const RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Lifecycle calls against a docker daemon, local or relayed by an agent.
pub struct DockerProvider {
    client: SharedDockerClient,
    kind: ProviderKind,
}

impl DockerProvider {
    pub fn new(client: SharedDockerClient) -> Self {
        Self {
            client,
            kind: ProviderKind::Docker,
        }
    }

    /// A provider for the docker daemon exposed by a remote agent
    pub fn agent(client: SharedDockerClient) -> Self {
        Self {
            client,
            kind: ProviderKind::Agent,
        }
    }

    fn docker(&self) -> &Docker {
        self.client.client()
    }
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> Result<ContainerStatus, ProviderError> {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) => Ok(ContainerStatus::Running),
        Some(ContainerStateStatusEnum::PAUSED) => Ok(ContainerStatus::Paused),
        Some(
            ContainerStateStatusEnum::EXITED
            | ContainerStateStatusEnum::DEAD
            | ContainerStateStatusEnum::CREATED
            | ContainerStateStatusEnum::RESTARTING,
        ) => Ok(ContainerStatus::Stopped),
        other => Err(ProviderError::UnexpectedStatus(format!("{:?}", other))),
    }
}

fn not_found(id: &str, err: bollard::errors::Error) -> ProviderError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => ProviderError::NotFound(id.to_string()),
        e => ProviderError::Docker(e),
    }
}

fn to_event(message: EventMessage) -> Option<ContainerEvent> {
    let action = Action::from_docker(message.action.as_deref()?)?;
    let actor = message.actor?;
    let actor_id = actor.id.unwrap_or_default();
    let actor_name = actor
        .attributes
        .and_then(|mut attrs| attrs.remove("name"))
        .unwrap_or_default();
    Some(ContainerEvent {
        action,
        actor_id,
        actor_name,
    })
}

fn event_filters(identity: &ContainerIdentity) -> HashMap<String, Vec<String>> {
    // The daemon matches names by prefix, so a name is only used before the
    // container has an id.
    let container = identity.reference().to_string();

    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    filters.insert("container".to_string(), vec![container]);
    filters.insert(
        "event".to_string(),
        Action::ALL.iter().map(|a| a.as_str().to_string()).collect(),
    );
    filters
}

/// Consume the daemon's event stream until `task` is cancelled, reconnecting
/// after errors.
async fn watch_events(
    docker: Docker,
    filters: HashMap<String, Vec<String>>,
    tx: mpsc::Sender<WatchMessage>,
    task: Task,
) {
    'subscribe: loop {
        let mut stream = docker.events(Some(EventsOptions::<String> {
            filters: filters.clone(),
            ..Default::default()
        }));

        let failure = loop {
            tokio::select! {
                _ = task.cancelled() => break 'subscribe,
                item = stream.next() => match item {
                    Some(Ok(message)) => {
                        let Some(event) = to_event(message) else { continue };
                        debug!(task = %task, event = %event, "docker event");
                        if tx.send(WatchMessage::Event(event)).await.is_err() {
                            break 'subscribe;
                        }
                    }
                    Some(Err(e)) => break ProviderError::Docker(e),
                    None => break ProviderError::Api("docker event stream closed".to_string()),
                },
            }
        };

        warn!(task = %task, error = %failure, "docker event stream failed, retrying");
        if tx.send(WatchMessage::Error(failure)).await.is_err() {
            break;
        }

        loop {
            tokio::select! {
                _ = task.cancelled() => break 'subscribe,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {
                    if docker.ping().await.is_ok() {
                        info!(task = %task, "docker daemon reachable again");
                        if tx.send(WatchMessage::Resync).await.is_err() {
                            break 'subscribe;
                        }
                        continue 'subscribe;
                    }
                }
            }
        }
    }

    task.finish(task.finish_cause().unwrap_or(Cause::Canceled)).await;
}

impl ContainerProvider for DockerProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn inspect<'a>(
        &'a self,
        identity: &'a ContainerIdentity,
    ) -> BoxFuture<'a, Result<ContainerInfo, ProviderError>> {
        Box::pin(async move {
            let reference = identity.reference();
            let info = self
                .docker()
                .inspect_container(reference, None::<InspectContainerOptions>)
                .await
                .map_err(|e| not_found(reference, e))?;

            let status = map_status(info.state.and_then(|s| s.status))?;
            Ok(ContainerInfo {
                id: info.id.unwrap_or_else(|| identity.id.clone()),
                name: info
                    .name
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| identity.name.clone()),
                status,
            })
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(async move {
            match self
                .docker()
                .start_container(id, None::<StartContainerOptions<String>>)
                .await
            {
                Ok(_) => {
                    info!(container_id = id, "Started Docker container");
                    Ok(())
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 304, ..
                }) => {
                    debug!(container_id = id, "Container was already running");
                    Ok(())
                }
                Err(e) => Err(not_found(id, e)),
            }
        })
    }

    fn stop<'a>(
        &'a self,
        id: &'a str,
        signal: Option<&'a str>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(async move {
            // The stop endpoint always sends the container's own stop signal,
            // so a configured one is delivered first through kill.
            if let Some(signal) = signal.filter(|s| !s.is_empty()) {
                self.kill(id, Some(signal)).await?;
            }

            let options = StopContainerOptions {
                t: timeout.as_secs() as i64,
            };
            match self.docker().stop_container(id, Some(options)).await {
                Ok(_) => {
                    info!(container_id = id, "Stopped Docker container");
                    Ok(())
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 304, ..
                }) => {
                    debug!(container_id = id, "Container was already stopped");
                    Ok(())
                }
                Err(e) => Err(not_found(id, e)),
            }
        })
    }

    fn pause<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(async move {
            self.docker()
                .pause_container(id)
                .await
                .map_err(|e| not_found(id, e))?;
            info!(container_id = id, "Paused Docker container");
            Ok(())
        })
    }

    fn unpause<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(async move {
            self.docker()
                .unpause_container(id)
                .await
                .map_err(|e| not_found(id, e))?;
            info!(container_id = id, "Unpaused Docker container");
            Ok(())
        })
    }

    fn kill<'a>(
        &'a self,
        id: &'a str,
        signal: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(async move {
            let signal = signal.filter(|s| !s.is_empty()).unwrap_or("SIGKILL");
            let options = KillContainerOptions { signal };
            match self.docker().kill_container(id, Some(options)).await {
                Ok(_) => {
                    info!(container_id = id, signal, "Killed Docker container");
                    Ok(())
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                }) => {
                    debug!(container_id = id, "Container not running");
                    Ok(())
                }
                Err(e) => Err(not_found(id, e)),
            }
        })
    }

    fn watch(&self, identity: &ContainerIdentity, task: Task) -> mpsc::Receiver<WatchMessage> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let docker = self.docker().clone();
        tokio::spawn(watch_events(docker, event_filters(identity), tx, task));
        rx
    }

    fn close(&self) {
        self.client.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::EventActor;

    #[test]
    fn test_map_status() {
        assert_eq!(
            map_status(Some(ContainerStateStatusEnum::RUNNING)).unwrap(),
            ContainerStatus::Running
        );
        assert_eq!(
            map_status(Some(ContainerStateStatusEnum::PAUSED)).unwrap(),
            ContainerStatus::Paused
        );
        for stopped in [
            ContainerStateStatusEnum::EXITED,
            ContainerStateStatusEnum::DEAD,
            ContainerStateStatusEnum::CREATED,
            ContainerStateStatusEnum::RESTARTING,
        ] {
            assert_eq!(map_status(Some(stopped)).unwrap(), ContainerStatus::Stopped);
        }
        assert!(map_status(Some(ContainerStateStatusEnum::REMOVING)).is_err());
        assert!(map_status(None).is_err());
    }

    #[test]
    fn test_to_event_reads_actor_name() {
        let mut attributes = HashMap::new();
        attributes.insert("name".to_string(), "whoami-renamed".to_string());
        let message = EventMessage {
            action: Some("start".to_string()),
            actor: Some(EventActor {
                id: Some("abc".to_string()),
                attributes: Some(attributes),
            }),
            ..Default::default()
        };

        let event = to_event(message).unwrap();
        assert_eq!(event.action, Action::Start);
        assert_eq!(event.actor_id, "abc");
        assert_eq!(event.actor_name, "whoami-renamed");
    }

    #[test]
    fn test_to_event_skips_other_actions() {
        let message = EventMessage {
            action: Some("exec_create: sh".to_string()),
            ..Default::default()
        };
        assert!(to_event(message).is_none());
    }

    #[test]
    fn test_event_filters() {
        let filters = event_filters(&ContainerIdentity::new("abc", "whoami"));
        assert_eq!(filters["type"], vec!["container"]);
        assert_eq!(filters["container"], vec!["abc"]);
        assert_eq!(filters["event"].len(), Action::ALL.len());
        assert!(filters["event"].contains(&"rename".to_string()));

        let filters = event_filters(&ContainerIdentity::new("", "whoami"));
        assert_eq!(filters["container"], vec!["whoami"]);
    }

    #[test]
    fn test_to_event_rename_carries_new_name() {
        let mut attributes = HashMap::new();
        attributes.insert("name".to_string(), "whoami-v2".to_string());
        attributes.insert("oldName".to_string(), "/whoami".to_string());
        let message = EventMessage {
            action: Some("rename".to_string()),
            actor: Some(EventActor {
                id: Some("abc".to_string()),
                attributes: Some(attributes),
            }),
            ..Default::default()
        };

        let event = to_event(message).unwrap();
        assert_eq!(event.action, Action::Rename);
        assert_eq!(event.actor_id, "abc");
        assert_eq!(event.actor_name, "whoami-v2");
    }
}
