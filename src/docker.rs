//! Shared, reference-counted docker clients
//!
//! Every idle watcher talking to the same daemon shares one client. Handles
//! are counted; a cleaner subtask closes clients nobody has referenced for
//! [`CLIENT_TTL`] and drops every client when the process shuts down.

use crate::error::ProviderError;
use crate::task::{Cause, Task};
use bollard::Docker;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Unreferenced clients older than this are closed
pub const CLIENT_TTL: Duration = Duration::from_secs(10);

/// Pool key for a client resolved from `DOCKER_HOST` or the local socket
pub const LOCAL_HOST: &str = "local";

const CONNECT_TIMEOUT_SECS: u64 = 120;

struct PooledClient {
    host: String,
    client: Docker,
    refs: AtomicUsize,
    last_used: Mutex<Instant>,
}

/// A counted handle to a pooled docker client.
///
/// The reference is released on [`SharedDockerClient::release`] or on drop,
/// whichever comes first.
pub struct SharedDockerClient {
    pooled: Arc<PooledClient>,
    released: AtomicBool,
}

impl SharedDockerClient {
    pub fn client(&self) -> &Docker {
        &self.pooled.client
    }

    pub fn host(&self) -> &str {
        &self.pooled.host
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.pooled.last_used.lock() = Instant::now();
        let left = self.pooled.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(host = %self.pooled.host, refs = left, "released docker client");
    }
}

impl Drop for SharedDockerClient {
    fn drop(&mut self) {
        self.release();
    }
}

/// Process-scoped map from docker host to a shared client.
#[derive(Default)]
pub struct DockerClientPool {
    clients: DashMap<String, Arc<PooledClient>>,
}

impl DockerClientPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get a client for `host`, connecting on first use.
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn acquire(&self, host: Option<&str>) -> Result<SharedDockerClient, ProviderError> {
        let key = host.unwrap_or(LOCAL_HOST).to_string();
        if let Some(shared) = self.share(&key) {
            return Ok(shared);
        }

        let client = connect(host).await?;
        let pooled = self
            .clients
            .entry(key.clone())
            .or_insert_with(|| {
                info!(host = %key, "connected to docker daemon");
                Arc::new(PooledClient {
                    host: key.clone(),
                    client,
                    refs: AtomicUsize::new(0),
                    last_used: Mutex::new(Instant::now()),
                })
            })
            .clone();
        pooled.refs.fetch_add(1, Ordering::AcqRel);
        Ok(SharedDockerClient {
            pooled,
            released: AtomicBool::new(false),
        })
    }

    fn share(&self, key: &str) -> Option<SharedDockerClient> {
        let entry = self.clients.get(key)?;
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Some(SharedDockerClient {
            pooled: Arc::clone(entry.value()),
            released: AtomicBool::new(false),
        })
    }

    /// Close clients that have been unreferenced for longer than `ttl`.
    /// Returns how many were closed.
    pub fn close_idle(&self, ttl: Duration) -> usize {
        let before = self.clients.len();
        self.clients.retain(|host, pooled| {
            let keep = pooled.refs.load(Ordering::Acquire) > 0
                || pooled.last_used.lock().elapsed() < ttl;
            if !keep {
                debug!(host = %host, "closing idle docker client");
            }
            keep
        });
        before - self.clients.len()
    }

    pub fn close_all(&self) {
        let count = self.clients.len();
        self.clients.clear();
        if count > 0 {
            info!(count, "closed docker clients");
        }
    }

    /// Current reference count of the client for `host`
    pub fn refs(&self, host: &str) -> Option<usize> {
        self.clients
            .get(host)
            .map(|pooled| pooled.refs.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Spawn the cleaner as a subtask of `parent`. It closes every client
    /// once `parent` is cancelled.
    pub fn start_cleaner(self: &Arc<Self>, parent: &Task) {
        let task = parent.subtask("docker_clients_cleaner", true);
        let pool = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLIENT_TTL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task.cancelled() => break,
                    _ = interval.tick() => {
                        let closed = pool.close_idle(CLIENT_TTL);
                        if closed > 0 {
                            debug!(closed, "docker client cleanup");
                        }
                    }
                }
            }
            pool.close_all();
            task.finish(task.finish_cause().unwrap_or(Cause::Canceled)).await;
        });
    }

    #[cfg(test)]
    fn insert_offline(&self, host: &str) {
        let client = Docker::connect_with_http("tcp://127.0.0.1:1", 1, bollard::API_DEFAULT_VERSION)
            .expect("http client builds without connecting");
        self.clients.insert(
            host.to_string(),
            Arc::new(PooledClient {
                host: host.to_string(),
                client,
                refs: AtomicUsize::new(0),
                last_used: Mutex::new(Instant::now()),
            }),
        );
    }
}

async fn connect(host: Option<&str>) -> Result<Docker, ProviderError> {
    let client = if let Some(host) = host {
        connect_to_host(host)?
    } else if let Ok(host) = std::env::var("DOCKER_HOST") {
        connect_to_host(&host)?
    } else {
        connect_with_defaults().await?
    };

    client.ping().await.map_err(|e| ProviderError::Connect {
        host: host.unwrap_or(LOCAL_HOST).to_string(),
        reason: format!(
            "Docker daemon is not responding: {}. Ensure Docker Desktop, Colima, or dockerd is running.",
            e
        ),
    })?;
    Ok(client)
}

fn connect_to_host(host: &str) -> Result<Docker, ProviderError> {
    let connect_err = |reason: String| ProviderError::Connect {
        host: host.to_string(),
        reason,
    };

    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .map_err(|e| connect_err(format!("Cannot connect to Unix socket '{}': {}", socket_path, e)))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .map_err(|e| connect_err(format!("Cannot connect to TCP endpoint: {}", e)))
    } else {
        Err(connect_err(
            "Invalid docker host format. Expected 'unix:///path/to/socket' or 'tcp://host:port'"
                .to_string(),
        ))
    }
}

async fn connect_with_defaults() -> Result<Docker, ProviderError> {
    let home = std::env::var("HOME").unwrap_or_default();
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let socket_paths: Vec<(&str, String)> = vec![
        ("Linux default", "/var/run/docker.sock".to_string()),
        ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
        ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
        ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
    ];

    let mut tried_paths = Vec::new();

    for (name, path) in &socket_paths {
        if path.is_empty() || path.contains("//") {
            continue;
        }

        if std::path::Path::new(path).exists() {
            debug!(path, name, "Found Docker socket");
            match Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION) {
                Ok(client) => {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                    tried_paths.push(format!("{} ({}) - socket exists but daemon not responding", path, name));
                }
                Err(e) => {
                    tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                }
            }
        }
    }

    Docker::connect_with_socket_defaults().map_err(|e| {
        let tried_info = if tried_paths.is_empty() {
            "No Docker socket found at common locations".to_string()
        } else {
            format!("Tried: {}", tried_paths.join("; "))
        };
        ProviderError::Connect {
            host: LOCAL_HOST.to_string(),
            reason: format!("{}. Underlying error: {}", tried_info, e),
        }
    })
}
