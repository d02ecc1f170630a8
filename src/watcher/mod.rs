//! Idle watchers
//!
//! A watcher follows one backend container. It stops (or pauses, or kills)
//! the container after a period without traffic and starts it again when a
//! request arrives. Each watcher runs a single event loop that owns every
//! state change; [`Watcher::wake`] and [`Watcher::status`] only read the
//! published state and send commands to the loop.
//!
//! The loop runs on the watcher's task, a subtask of the route provider that
//! registered it. Cancelling that task unregisters the watcher, releases the
//! provider and finishes the task.
//!
//! A watcher may depend on other watchers. Dependencies are woken before the
//! container and stopped after it.

mod progress;
mod registry;
mod state;

pub use progress::{WakeEvent, WakeEventKind, WakeEvents, WAKE_EVENT_HISTORY};
pub use registry::WatcherRegistry;
pub use state::{ContainerState, IdleSettings, ProxyTarget, StopMethod, WatcherSnapshot};

use crate::error::{ProviderError, WatcherError};
use crate::events::{Action, ContainerEvent, WatchMessage};
use crate::health::{HealthChecker, HealthStatus};
use crate::provider::{ContainerIdentity, ContainerInfo, ContainerProvider, ContainerStatus};
use crate::task::{Cause, Task};
use futures::future::{try_join_all, BoxFuture};
use parking_lot::RwLock;
use state::Command;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::{timeout, Instant, Sleep};
use tracing::{debug, error, info, warn};

/// Ceiling of an inspect call made on behalf of a watcher
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Added to the configured stop timeout to bound the whole stop call
pub const STOP_GRACE: Duration = Duration::from_secs(3);

/// How often `wake_and_wait` re-probes the backend
pub const WAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A watcher that must be up before another one wakes
#[derive(Clone)]
pub struct Dependency {
    pub watcher: Arc<Watcher>,
    /// Wait for a successful probe, not only for the container to start
    pub wait_healthy: bool,
}

/// Everything a route contributes when it registers a watcher
pub struct WatcherConfig {
    pub identity: ContainerIdentity,
    pub settings: IdleSettings,
    pub target: ProxyTarget,
    pub health: Arc<dyn HealthChecker>,
    pub dependencies: Vec<Dependency>,
}

/// How the actor of an event relates to the watched container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Actor {
    Same,
    /// Same id, new name carried by a rename event
    Renamed,
    /// New id under exactly the same name
    Recreated,
    Foreign,
}

fn classify_actor(identity: &ContainerIdentity, event: &ContainerEvent) -> Actor {
    let same_id = event.actor_id.is_empty() || event.actor_id == identity.id;
    let same_name = event.actor_name.is_empty() || event.actor_name == identity.name;
    match (same_id, same_name) {
        (true, true) => Actor::Same,
        (true, false) if event.action == Action::Rename => Actor::Renamed,
        // Names drift without a rename event only when one was missed
        (true, false) => Actor::Same,
        (false, _) if !event.actor_name.is_empty() && event.actor_name == identity.name => {
            Actor::Recreated
        }
        (false, _) => Actor::Foreign,
    }
}

pub struct Watcher {
    identity: RwLock<ContainerIdentity>,
    settings: RwLock<IdleSettings>,
    target: RwLock<ProxyTarget>,
    health: RwLock<Arc<dyn HealthChecker>>,
    dependencies: RwLock<Vec<Dependency>>,
    provider: Arc<dyn ContainerProvider>,
    wake_events: WakeEvents,
    state: watch::Sender<ContainerState>,
    commands: mpsc::UnboundedSender<Command>,
    wake_lock: Mutex<()>,
    task: Task,
}

async fn inspect_bounded(
    provider: &dyn ContainerProvider,
    identity: &ContainerIdentity,
) -> Result<ContainerInfo, ProviderError> {
    timeout(REQUEST_TIMEOUT, provider.inspect(identity))
        .await
        .unwrap_or(Err(ProviderError::Timeout {
            op: "inspect",
            timeout: REQUEST_TIMEOUT,
        }))
}

impl Watcher {
    /// Register a watcher for `config.identity` under `parent`.
    ///
    /// A live watcher for the same container takes the new settings, health
    /// checker and target in place and re-arms its idle timer; `provider` is
    /// then released unused. Otherwise the container is inspected and a new
    /// watcher with its own event loop is started.
    pub async fn register(
        parent: &Task,
        registry: &Arc<WatcherRegistry>,
        config: WatcherConfig,
        provider: Arc<dyn ContainerProvider>,
    ) -> Result<Arc<Watcher>, WatcherError> {
        let _guard = registry.lock_registration().await;

        if let Some(existing) = registry
            .get(&config.identity.id)
            .filter(|w| !w.is_stopped())
        {
            provider.close();
            existing.reconfigure(config)?;
            return Ok(existing);
        }

        let info = match inspect_bounded(provider.as_ref(), &config.identity).await {
            Ok(info) => info,
            Err(e) => {
                provider.close();
                return Err(e.into());
            }
        };

        if let Some(existing) = registry.get(&info.id).filter(|w| !w.is_stopped()) {
            provider.close();
            existing.reconfigure(config)?;
            return Ok(existing);
        }

        let identity = info.identity();
        let running = info.status == ContainerStatus::Running;
        let task = parent.subtask(format!("idlewatcher.{}", identity), true);
        let (state, _) = watch::channel(ContainerState::observed(running));
        let (commands, rx) = mpsc::unbounded_channel();

        let watcher = Arc::new(Watcher {
            identity: RwLock::new(identity.clone()),
            settings: RwLock::new(config.settings),
            target: RwLock::new(config.target),
            health: RwLock::new(config.health),
            dependencies: RwLock::new(config.dependencies),
            provider,
            wake_events: WakeEvents::new(),
            state,
            commands,
            wake_lock: Mutex::new(()),
            task,
        });
        registry.insert(identity.id.clone(), Arc::clone(&watcher));

        info!(
            watcher = %identity,
            container_id = %identity.id,
            provider = %watcher.provider.kind(),
            status = ?info.status,
            "Idle watcher registered"
        );
        tokio::spawn(Arc::clone(&watcher).run(rx, Arc::clone(registry)));
        Ok(watcher)
    }

    fn reconfigure(&self, config: WatcherConfig) -> Result<(), WatcherError> {
        *self.settings.write() = config.settings;
        *self.target.write() = config.target;
        *self.health.write() = config.health;
        *self.dependencies.write() = config.dependencies;
        debug!(watcher = %self.name(), "Idle watcher reconfigured");
        self.send(Command::Rearm)
    }

    /// Make sure the container is running.
    ///
    /// A running container only has its idle timer reset. Otherwise its
    /// dependencies are woken first, then the container is inspected and
    /// started or unpaused, all bounded by the wake timeout. On success the
    /// watcher is `starting`; callers poll [`Watcher::status`] to learn when
    /// it is ready.
    pub async fn wake(&self) -> Result<(), WatcherError> {
        if self.is_stopped() {
            return Err(self.stopped());
        }
        if self.is_running() {
            return self.send(Command::Touch);
        }

        let _guard = self.wake_lock.lock().await;
        if self.is_running() {
            return self.send(Command::Touch);
        }

        let settings = self.settings();
        let identity = self.identity();
        debug!(watcher = %identity, "Waking container");
        self.wake_events.clear();

        let woke = async {
            self.wake_dependencies(&identity).await?;
            self.start_container(&identity).await
        };
        let woke = timeout(settings.wake_timeout, woke)
            .await
            .unwrap_or_else(|_| {
                Err(WatcherError::WakeTimeout {
                    name: identity.to_string(),
                    timeout: settings.wake_timeout,
                })
            });
        if let Err(e) = woke {
            warn!(watcher = %identity, error = %e, "Failed to wake container");
            self.wake_events.send(
                WakeEventKind::Error,
                format!("Failed to start {}", identity.name),
                Some(e.to_string()),
            );
            let _ = self.commands.send(Command::Failed(e.to_string()));
            return Err(e);
        }
        self.wake_events.send(
            WakeEventKind::ContainerWoke,
            format!("{} started successfully", identity.name),
            None,
        );
        self.wake_events.send(
            WakeEventKind::WaitingReady,
            format!("Waiting for {} to be ready...", identity.name),
            None,
        );

        let (ack, acked) = oneshot::channel();
        self.send(Command::Woke(ack))?;
        acked.await.map_err(|_| self.stopped())
    }

    async fn start_container(&self, identity: &ContainerIdentity) -> Result<(), WatcherError> {
        let info = inspect_bounded(self.provider.as_ref(), identity).await?;
        match info.status {
            ContainerStatus::Stopped => {
                self.wake_events.send(
                    WakeEventKind::Starting,
                    format!("{} is starting...", identity.name),
                    None,
                );
                self.provider.start(&info.id).await?
            }
            ContainerStatus::Paused => {
                self.wake_events.send(
                    WakeEventKind::Starting,
                    format!("{} is unpausing...", identity.name),
                    None,
                );
                self.provider.unpause(&info.id).await?
            }
            ContainerStatus::Running => {}
        }
        Ok(())
    }

    /// Wake every dependency concurrently. Those with `wait_healthy` must
    /// also pass a probe.
    async fn wake_dependencies(&self, identity: &ContainerIdentity) -> Result<(), WatcherError> {
        let dependencies = self.dependencies.read().clone();
        if dependencies.is_empty() {
            return Ok(());
        }

        let wakes = dependencies.iter().map(|dep| async move {
            let dep_name = dep.watcher.name();
            let failed = |source: WatcherError| WatcherError::Dependency {
                name: identity.to_string(),
                dependency: dep_name.clone(),
                source: Box::new(source),
            };

            self.wake_events.send(
                WakeEventKind::WakingDep,
                format!("Waking dependency: {}", dep_name),
                None,
            );
            wake_boxed(&dep.watcher).await.map_err(failed)?;
            self.wake_events.send(
                WakeEventKind::DepReady,
                format!("Dependency woke: {}", dep_name),
                None,
            );
            if dep.wait_healthy {
                dep.watcher.wait_ready().await.map_err(failed)?;
            }
            Ok::<_, WatcherError>(())
        });

        try_join_all(wakes).await.map(|_| ()).inspect_err(|e| {
            self.wake_events.send(
                WakeEventKind::Error,
                "Failed to wake dependencies",
                Some(e.to_string()),
            );
        })
    }

    /// Current status. `starting` and `error` probe the backend and report
    /// the outcome to the event loop; `napping` and `healthy` do not.
    pub async fn status(&self) -> HealthStatus {
        self.probe().await.0
    }

    async fn probe(&self) -> (HealthStatus, Option<String>) {
        let state = self.current_state();
        let status = state.status();
        if matches!(status, HealthStatus::Napping | HealthStatus::Healthy) {
            return (status, None);
        }
        if !self.target.read().is_resolved() {
            return (status, state.error);
        }

        let checker = self.health_checker();
        match checker.check_health().await {
            Ok(result) if result.healthy => {
                let _ = self.commands.send(Command::Probed(Ok(true)));
                (HealthStatus::Healthy, None)
            }
            Ok(result) => {
                debug!(watcher = %self.name(), detail = %result.detail, "Backend not ready yet");
                let _ = self.commands.send(Command::Probed(Ok(false)));
                (HealthStatus::Starting, None)
            }
            Err(e) => {
                let detail = e.to_string();
                let _ = self.commands.send(Command::Probed(Err(detail.clone())));
                (HealthStatus::Error, Some(detail))
            }
        }
    }

    /// Wake the container and poll until it is healthy, fails, or the wake
    /// timeout elapses.
    pub async fn wake_and_wait(&self) -> Result<(), WatcherError> {
        let wake_timeout = self.settings().wake_timeout;
        let name = self.name();

        let ready = async {
            self.wake().await?;
            self.wait_ready().await
        };
        timeout(wake_timeout, ready).await.unwrap_or_else(|_| {
            Err(WatcherError::WakeTimeout {
                name: name.clone(),
                timeout: wake_timeout,
            })
        })
    }

    async fn wait_ready(&self) -> Result<(), WatcherError> {
        let name = self.name();
        loop {
            match self.probe().await {
                (HealthStatus::Healthy, _) => return Ok(()),
                (HealthStatus::Error, detail) => {
                    return Err(WatcherError::Unhealthy {
                        name: name.to_string(),
                        detail: detail.unwrap_or_default(),
                    })
                }
                (HealthStatus::Napping, _) => {
                    return Err(WatcherError::Unhealthy {
                        name: name.to_string(),
                        detail: "container stopped while waking".to_string(),
                    })
                }
                _ => {}
            }
            if self.is_stopped() {
                return Err(self.stopped());
            }
            tokio::time::sleep(WAKE_POLL_INTERVAL).await;
        }
    }

    /// Status derived from the published state, without probing
    pub fn current_status(&self) -> HealthStatus {
        self.state.borrow().status()
    }

    pub fn current_state(&self) -> ContainerState {
        self.state.borrow().clone()
    }

    /// Events of the current or last wake, then the ones that follow
    pub fn wake_events(&self) -> (Vec<WakeEvent>, broadcast::Receiver<WakeEvent>) {
        self.wake_events.subscribe()
    }

    /// Stop the container now, then its dependencies. Used by dependents
    /// when they go to sleep.
    pub async fn stop(&self) -> Result<(), WatcherError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Stop(ack))?;
        done.await.map_err(|_| self.stopped())?
    }

    pub fn snapshot(&self) -> WatcherSnapshot {
        let state = self.current_state();
        let identity = self.identity();
        let target = self.target();
        WatcherSnapshot {
            name: identity.name,
            container_id: identity.id,
            provider: self.provider.kind(),
            status: state.status(),
            url: target.is_resolved().then(|| target.url().to_string()),
            health: self.health_checker().config().clone(),
            idle: self.settings(),
            detail: state.error.unwrap_or_default(),
            expires_in: state
                .idle_deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }

    pub fn identity(&self) -> ContainerIdentity {
        self.identity.read().clone()
    }

    pub fn name(&self) -> String {
        self.identity.read().to_string()
    }

    pub fn settings(&self) -> IdleSettings {
        self.settings.read().clone()
    }

    pub fn target(&self) -> ProxyTarget {
        self.target.read().clone()
    }

    pub fn health_checker(&self) -> Arc<dyn HealthChecker> {
        Arc::clone(&self.health.read())
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        self.dependencies.read().clone()
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().running
    }

    /// The event loop has exited
    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    fn stopped(&self) -> WatcherError {
        WatcherError::Stopped(self.name())
    }

    fn send(&self, command: Command) -> Result<(), WatcherError> {
        self.commands.send(command).map_err(|_| self.stopped())
    }

    fn update(&self, f: impl FnOnce(&mut ContainerState)) {
        self.state.send_modify(f);
    }

    /// (Re)start the idle timer. Returns whether it is armed.
    fn arm(&self, idle: Pin<&mut Sleep>) -> bool {
        let idle_timeout = self.settings.read().idle_timeout;
        if idle_timeout.is_zero() {
            self.update(|s| s.idle_deadline = None);
            return false;
        }
        let deadline = Instant::now() + idle_timeout;
        idle.reset(deadline);
        self.update(|s| s.idle_deadline = Some(deadline));
        true
    }

    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        registry: Arc<WatcherRegistry>,
    ) {
        let mut events_task = self.task.subtask("events", true);
        let mut events = self.provider.watch(&self.identity(), events_task.clone());

        let idle = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(idle);
        let mut armed = self.is_running() && self.arm(idle.as_mut());

        let cause = loop {
            tokio::select! {
                biased;
                _ = self.task.cancelled() => {
                    break self.task.finish_cause().unwrap_or(Cause::Canceled);
                }
                Some(command) = commands.recv() => match command {
                    Command::Touch | Command::Rearm if self.is_running() => {
                        armed = self.arm(idle.as_mut());
                    }
                    Command::Touch => {}
                    Command::Rearm => {
                        armed = false;
                        self.update(|s| s.idle_deadline = None);
                    }
                    Command::Woke(ack) => {
                        self.update(ContainerState::set_starting);
                        armed = self.arm(idle.as_mut());
                        let _ = ack.send(());
                    }
                    Command::Failed(detail) => self.update(|s| s.error = Some(detail)),
                    Command::Probed(outcome) => {
                        let mut became_ready = false;
                        self.update(|s| {
                            if !s.running {
                                return;
                            }
                            match outcome {
                                Ok(ready) => {
                                    became_ready = ready && !s.ready;
                                    s.ready = ready;
                                    s.error = None;
                                }
                                Err(detail) => s.error = Some(detail),
                            }
                        });
                        if became_ready {
                            self.wake_events.send(
                                WakeEventKind::Ready,
                                format!("{} is ready", self.identity().name),
                                None,
                            );
                        }
                    }
                    Command::Stop(ack) => {
                        armed = false;
                        self.update(|s| s.idle_deadline = None);
                        let _ = ack.send(self.stop_by_method().await);
                    }
                },
                message = events.recv() => match message {
                    Some(WatchMessage::Event(event)) => {
                        match self.adopt_actor(&event, &registry) {
                            Actor::Foreign => {
                                debug!(watcher = %self.name(), event = %event, "Ignoring event for another container");
                                continue;
                            }
                            Actor::Recreated => {
                                events_task.finish("container recreated").await;
                                events_task = self.task.subtask("events", true);
                                events = self.provider.watch(&self.identity(), events_task.clone());
                            }
                            Actor::Same | Actor::Renamed => {}
                        }
                        match event.action {
                            Action::Destroy => break Cause::from("container destroyed"),
                            action if action.is_wake() => {
                                debug!(watcher = %self.name(), %action, "Container woke");
                                self.update(ContainerState::set_starting);
                                armed = self.arm(idle.as_mut());
                            }
                            action if action.is_sleep() => {
                                debug!(watcher = %self.name(), %action, "Container went to sleep");
                                self.update(ContainerState::set_napping);
                                armed = false;
                            }
                            _ => {}
                        }
                    }
                    Some(WatchMessage::Error(e)) => {
                        warn!(watcher = %self.name(), error = %e, kind = e.as_label(), "Container event stream error");
                    }
                    Some(WatchMessage::Resync) => {
                        armed = self.resync(idle.as_mut(), armed).await;
                    }
                    None => break Cause::from("event stream closed"),
                },
                _ = &mut idle, if armed => {
                    armed = false;
                    self.idle_expired().await;
                }
            }
        };

        commands.close();
        let identity = self.identity();
        registry.remove_if_same(&identity.id, &self);
        self.provider.close();
        events_task.finish(cause.clone()).await;
        info!(watcher = %identity, cause = %cause, "Idle watcher stopped");
        self.task.finish(cause).await;
    }

    /// Decide whether `event` is about the watched container and adopt a
    /// rename or recreate it reports.
    fn adopt_actor(self: &Arc<Self>, event: &ContainerEvent, registry: &WatcherRegistry) -> Actor {
        let mut identity = self.identity.write();
        let actor = classify_actor(&identity, event);
        let old = identity.clone();
        match actor {
            Actor::Same | Actor::Foreign => return actor,
            Actor::Renamed => identity.name = event.actor_name.clone(),
            Actor::Recreated => identity.id = event.actor_id.clone(),
        }
        let new = identity.clone();
        drop(identity);

        if actor == Actor::Recreated {
            registry.rekey(&old.id, &new.id, self);
        }
        info!(
            old_name = %old.name,
            old_id = %old.id,
            name = %new.name,
            id = %new.id,
            "Container identity changed"
        );
        actor
    }

    async fn resync(&self, idle: Pin<&mut Sleep>, armed: bool) -> bool {
        let info = match inspect_bounded(self.provider.as_ref(), &self.identity()).await {
            Ok(info) => info,
            Err(e) => {
                warn!(watcher = %self.name(), error = %e, "Failed to inspect container after resync");
                return armed;
            }
        };

        match (info.status == ContainerStatus::Running, self.is_running()) {
            (true, true) => armed,
            (true, false) => {
                self.update(ContainerState::set_starting);
                self.arm(idle)
            }
            (false, _) => {
                self.update(ContainerState::set_napping);
                false
            }
        }
    }

    async fn idle_expired(&self) {
        self.update(|s| s.idle_deadline = None);
        let settings = self.settings();
        info!(
            watcher = %self.name(),
            method = %settings.stop_method,
            idle_timeout = ?settings.idle_timeout,
            "Idle timeout reached, stopping container"
        );
        if let Err(e) = self.stop_by_method().await {
            debug!(watcher = %self.name(), error = %e, "Idle stop incomplete");
        }
    }

    /// Stop the container if it runs, then its dependencies. A failed stop
    /// leaves the dependencies running.
    async fn stop_by_method(&self) -> Result<(), WatcherError> {
        if self.is_running() {
            let settings = self.settings();
            let identity = self.identity();
            let ceiling = settings.stop_timeout + STOP_GRACE;
            let stopped = timeout(ceiling, self.stop_container(&identity.id, &settings))
                .await
                .unwrap_or(Err(ProviderError::Timeout {
                    op: "stop",
                    timeout: ceiling,
                }));
            if let Err(e) = stopped {
                error!(watcher = %identity, error = %e, kind = e.as_label(), "Failed to stop container");
                self.update(|s| s.error = Some(e.to_string()));
                return Err(e.into());
            }
            info!(watcher = %identity, method = %settings.stop_method, "Container stopped");
            self.update(ContainerState::set_napping);
        }
        self.stop_dependencies().await
    }

    async fn stop_dependencies(&self) -> Result<(), WatcherError> {
        let dependencies = self.dependencies.read().clone();
        let stops = dependencies.iter().map(|dep| async move {
            dep.watcher.stop().await.map_err(|source| {
                warn!(watcher = %self.name(), dependency = %dep.watcher.name(), error = %source, "Failed to stop dependency");
                WatcherError::Dependency {
                    name: self.name(),
                    dependency: dep.watcher.name(),
                    source: Box::new(source),
                }
            })
        });
        try_join_all(stops).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str, settings: &IdleSettings) -> Result<(), ProviderError> {
        let signal = settings.stop_signal.as_deref();
        match settings.stop_method {
            StopMethod::Stop => self.provider.stop(id, signal, settings.stop_timeout).await,
            StopMethod::Pause => self.provider.pause(id).await,
            StopMethod::Kill => self.provider.kill(id, signal).await,
        }
    }
}

/// Boxed so that chains of dependencies can recurse through `wake`
fn wake_boxed(watcher: &Watcher) -> BoxFuture<'_, Result<(), WatcherError>> {
    Box::pin(watcher.wake())
}
