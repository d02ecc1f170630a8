//! Route table and the idle watchers behind it
//!
//! The route provider owns a task under the root. Every route with idle
//! watching enabled gets a watcher registered under that task; reloading the
//! configuration registers new routes, re-arms changed ones and stops
//! watchers no route references anymore.
//!
//! Routes named in another route's `depends_on` are registered first, with
//! their idle timer disabled; their dependents wake and stop them.

use crate::config::{Config, RouteConfig};
use crate::docker::DockerClientPool;
use crate::error::{ProviderError, WatcherError};
use crate::health::checker_for;
use crate::provider::{ContainerProvider, DockerProvider, ProviderKind, ProxmoxProvider};
use crate::task::{Cause, Task};
use crate::watcher::{
    Dependency, IdleSettings, Watcher, WatcherConfig, WatcherRegistry, WatcherSnapshot,
};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Builds the lifecycle provider for a route
pub trait ProviderFactory: Send + Sync {
    fn build<'a>(
        &'a self,
        route: &'a RouteConfig,
        config: &'a Config,
    ) -> BoxFuture<'a, Result<Arc<dyn ContainerProvider>, WatcherError>>;
}

/// Docker and agent routes share pooled docker clients; proxmox routes get
/// their own API client.
pub struct DefaultProviders {
    docker: Arc<DockerClientPool>,
}

impl DefaultProviders {
    pub fn new(docker: Arc<DockerClientPool>) -> Self {
        Self { docker }
    }
}

impl ProviderFactory for DefaultProviders {
    fn build<'a>(
        &'a self,
        route: &'a RouteConfig,
        config: &'a Config,
    ) -> BoxFuture<'a, Result<Arc<dyn ContainerProvider>, WatcherError>> {
        Box::pin(async move {
            let provider: Arc<dyn ContainerProvider> = match route.provider {
                ProviderKind::Docker => {
                    let host = route.docker_host.as_deref().or(config.docker.host.as_deref());
                    Arc::new(DockerProvider::new(self.docker.acquire(host).await?))
                }
                ProviderKind::Agent => {
                    let host = route.docker_host.as_deref().or(route.agent.as_deref());
                    Arc::new(DockerProvider::agent(self.docker.acquire(host).await?))
                }
                ProviderKind::Proxmox => {
                    let (Some(settings), Some(target)) = (&config.proxmox, &route.proxmox) else {
                        return Err(ProviderError::Api("proxmox is not configured".to_string()).into());
                    };
                    Arc::new(ProxmoxProvider::new(settings, &target.node, target.vmid)?)
                }
            };
            Ok(provider)
        })
    }
}

/// Routes touched by one `apply_config`
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl ReloadResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

struct RouteEntry {
    config: RouteConfig,
    settings: IdleSettings,
    dependencies: Vec<Dependency>,
    watcher: Arc<Watcher>,
}

fn same_dependencies(a: &[Dependency], b: &[Dependency]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(a, b)| {
            Arc::ptr_eq(&a.watcher, &b.watcher) && a.wait_healthy == b.wait_healthy
        })
}

pub struct RouteProvider {
    task: Task,
    registry: Arc<WatcherRegistry>,
    factory: Arc<dyn ProviderFactory>,
    routes: RwLock<HashMap<String, RouteEntry>>,
    known: RwLock<HashSet<String>>,
    applying: Mutex<()>,
}

impl RouteProvider {
    pub fn new(
        parent: &Task,
        registry: Arc<WatcherRegistry>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Arc<Self> {
        let task = parent.subtask("routes", true);
        let watched = task.clone();
        tokio::spawn(async move {
            watched.cancelled().await;
            watched
                .finish(watched.finish_cause().unwrap_or(Cause::Canceled))
                .await;
        });

        Arc::new(Self {
            task,
            registry,
            factory,
            routes: RwLock::new(HashMap::new()),
            known: RwLock::new(HashSet::new()),
            applying: Mutex::new(()),
        })
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn registry(&self) -> &Arc<WatcherRegistry> {
        &self.registry
    }

    /// Cancel the route task; every watcher under it stops
    pub async fn finish(&self, reason: &str) {
        self.task.finish(reason).await;
    }

    /// Bring the watchers in line with `config`.
    ///
    /// Routes whose provider or registration fails are logged and skipped;
    /// the next reload tries them again.
    pub async fn apply_config(&self, config: &Config) -> ReloadResult {
        let _guard = self.applying.lock().await;
        let mut result = ReloadResult::default();

        *self.known.write() = config.routes.keys().cloned().collect();
        let names = config.route_order().unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring route dependencies");
            let mut names: Vec<_> = config.routes.keys().cloned().collect();
            names.sort();
            names
        });
        let depended = config.dependency_routes();

        let mut wanted = Vec::new();
        let mut orphans = Vec::new();
        for name in names {
            let route = &config.routes[&name];
            let settings = if depended.contains(&name) {
                route.dependency_settings(&config.idle_defaults)
            } else {
                route.idle_settings(&config.idle_defaults)
            };
            let Some(settings) = settings else {
                continue;
            };
            wanted.push(name.clone());

            let dependencies = match self.dependencies_of(route) {
                Ok(dependencies) => dependencies,
                Err(e) => {
                    warn!(route = %name, error = %e, "Skipping route with unavailable dependencies");
                    continue;
                }
            };

            let existing = self.routes.read().get(&name).map(|entry| {
                (
                    entry.config == *route
                        && entry.settings == settings
                        && same_dependencies(&entry.dependencies, &dependencies),
                    entry.watcher.is_stopped(),
                )
            });
            if let Some((true, false)) = existing {
                continue;
            }

            match self
                .register(route, settings.clone(), dependencies.clone(), config)
                .await
            {
                Ok(watcher) => {
                    let replaced = self.routes.write().insert(
                        name.clone(),
                        RouteEntry {
                            config: route.clone(),
                            settings,
                            dependencies,
                            watcher: Arc::clone(&watcher),
                        },
                    );
                    if let Some(old) = replaced.filter(|old| !Arc::ptr_eq(&old.watcher, &watcher)) {
                        orphans.push(old.watcher);
                    }
                    if existing.is_some() {
                        result.updated.push(name);
                    } else {
                        result.added.push(name);
                    }
                }
                Err(e) => {
                    warn!(route = %name, error = %e, "Failed to register idle watcher");
                }
            }
        }

        let removed: Vec<Arc<Watcher>> = {
            let mut routes = self.routes.write();
            let gone: Vec<String> = routes
                .keys()
                .filter(|name| !wanted.contains(*name))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|name| {
                    let entry = routes.remove(&name)?;
                    result.removed.push(name);
                    Some(entry.watcher)
                })
                .collect()
        };
        result.removed.sort();

        for watcher in removed.into_iter().chain(orphans) {
            let still_used = self
                .routes
                .read()
                .values()
                .any(|entry| Arc::ptr_eq(&entry.watcher, &watcher));
            if !still_used {
                watcher.task().finish("route removed").await;
            }
        }

        if !result.is_empty() {
            info!(
                added = result.added.len(),
                removed = result.removed.len(),
                updated = result.updated.len(),
                "Routes applied"
            );
        }
        result
    }

    /// Watchers of the routes `route` depends on. They are registered
    /// earlier in the same pass.
    fn dependencies_of(&self, route: &RouteConfig) -> Result<Vec<Dependency>, WatcherError> {
        let deps = route.dependencies().map_err(ProviderError::Api)?;
        let routes = self.routes.read();
        deps.into_iter()
            .map(|dep| {
                let watcher = routes
                    .get(&dep.route)
                    .map(|entry| Arc::clone(&entry.watcher))
                    .ok_or_else(|| WatcherError::NotFound(dep.route.clone()))?;
                Ok(Dependency {
                    watcher,
                    wait_healthy: dep.wait_healthy,
                })
            })
            .collect()
    }

    async fn register(
        &self,
        route: &RouteConfig,
        settings: IdleSettings,
        dependencies: Vec<Dependency>,
        config: &Config,
    ) -> Result<Arc<Watcher>, WatcherError> {
        let target = route.proxy_target().map_err(ProviderError::Api)?;
        let agent = route.agent_url().map_err(ProviderError::Api)?;
        let health = checker_for(target.url(), agent.as_ref(), route.health_config());
        let provider = self.factory.build(route, config).await?;

        Watcher::register(
            &self.task,
            &self.registry,
            WatcherConfig {
                identity: route.identity(),
                settings,
                target,
                health,
                dependencies,
            },
            provider,
        )
        .await
    }

    /// Load `path` and apply it
    pub async fn reload(&self, path: &Path) -> anyhow::Result<ReloadResult> {
        let config = Config::load(path)?;
        Ok(self.apply_config(&config).await)
    }

    /// Whether `route` is configured, watched or not
    pub fn is_known(&self, route: &str) -> bool {
        self.known.read().contains(route)
    }

    pub fn watcher_for(&self, route: &str) -> Result<Arc<Watcher>, WatcherError> {
        let watcher = self
            .routes
            .read()
            .get(route)
            .map(|entry| Arc::clone(&entry.watcher))
            .ok_or_else(|| WatcherError::NotFound(route.to_string()))?;
        if watcher.is_stopped() {
            return Err(WatcherError::Stopped(route.to_string()));
        }
        Ok(watcher)
    }

    /// Wake the backend of `route` and wait until it is healthy
    pub async fn wake(&self, route: &str) -> Result<(), WatcherError> {
        self.watcher_for(route)?.wake_and_wait().await
    }

    /// Snapshots of every routed watcher, by route name
    pub fn snapshots(&self) -> Vec<(String, WatcherSnapshot)> {
        let mut list: Vec<_> = self
            .routes
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.watcher.snapshot()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Root;

    #[tokio::test]
    async fn test_unreachable_docker_skips_route() {
        let root = Root::new();
        let docker = DockerClientPool::new();
        let routes = RouteProvider::new(
            root.task(),
            WatcherRegistry::new(),
            Arc::new(DefaultProviders::new(docker)),
        );

        let config: Config = toml::from_str(
            r#"
[routes.whoami]
container = "whoami"
docker_host = "not-a-docker-host"
port = 80

[routes.whoami.idlewatcher]
idle_timeout_secs = 60
"#,
        )
        .unwrap();

        let result = routes.apply_config(&config).await;
        assert!(result.is_empty());
        assert!(matches!(
            routes.watcher_for("whoami"),
            Err(WatcherError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_routes_without_idle_timeout_are_ignored() {
        let root = Root::new();
        let routes = RouteProvider::new(
            root.task(),
            WatcherRegistry::new(),
            Arc::new(DefaultProviders::new(DockerClientPool::new())),
        );
        let config: Config = toml::from_str(
            r#"
[routes.static]
port = 8080
"#,
        )
        .unwrap();

        assert!(routes.apply_config(&config).await.is_empty());
        assert!(routes.is_empty());
        assert!(routes.is_known("static"));
        assert!(!routes.is_known("dynamic"));
    }
}
