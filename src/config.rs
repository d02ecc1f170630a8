use crate::health::{HealthCheckConfig, WAKE_PROBE_TIMEOUT};
use crate::provider::{ContainerIdentity, ProviderKind, ProxmoxSettings};
use crate::watcher::{IdleSettings, ProxyTarget, StopMethod};
use reqwest::Url;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Signals accepted for `stop_signal`
pub const STOP_SIGNALS: [&str; 8] = [
    "SIGINT", "SIGTERM", "SIGQUIT", "SIGHUP", "INT", "TERM", "QUIT", "HUP",
];

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    /// Proxmox VE cluster, required by routes using the proxmox provider
    pub proxmox: Option<ProxmoxSettings>,

    /// Idle settings used where a route does not override them
    #[serde(default)]
    pub idle_defaults: IdleDefaults,

    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port of the admin API (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bind address of the admin API
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Bearer token protecting the watcher endpoints.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Ceiling for draining the task tree on exit
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_port: default_admin_port(),
            bind: default_bind_address(),
            admin_token: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerConfig {
    /// `unix://` or `tcp://` address; `DOCKER_HOST` or the local socket
    /// when unset
    pub host: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdleDefaults {
    /// Zero leaves routes without their own idle timeout unwatched
    #[serde(default)]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_wake_timeout")]
    pub wake_timeout_secs: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    #[serde(default)]
    pub stop_method: StopMethod,

    pub stop_signal: Option<String>,
}

impl Default for IdleDefaults {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 0,
            wake_timeout_secs: default_wake_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            stop_method: StopMethod::default(),
            stop_signal: None,
        }
    }
}

/// Per-route overrides of [`IdleDefaults`]
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct IdleOverrides {
    pub idle_timeout_secs: Option<u64>,
    pub wake_timeout_secs: Option<u64>,
    pub stop_timeout_secs: Option<u64>,
    pub stop_method: Option<StopMethod>,
    pub stop_signal: Option<String>,

    /// Routes woken before this one and stopped after it, as
    /// `route` or `route:condition`
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// One parsed `depends_on` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependsOn {
    pub route: String,
    /// `service_healthy`: the dependency must also pass a probe
    pub wait_healthy: bool,
}

impl DependsOn {
    /// Parse `route`, `route:service_started` or `route:service_healthy`.
    /// An empty route name yields `None`.
    pub fn parse(entry: &str) -> Result<Option<Self>, String> {
        let (route, condition) = match entry.split_once(':') {
            Some((route, condition)) => (route, Some(condition)),
            None => (entry, None),
        };
        if route.is_empty() {
            return Ok(None);
        }
        let wait_healthy = match condition {
            None | Some("service_started") => false,
            Some("service_healthy") => true,
            Some(other) => {
                return Err(format!(
                    "dependency '{}' has unsupported condition '{}'",
                    route, other
                ))
            }
        };
        Ok(Some(Self {
            route: route.to_string(),
            wait_healthy,
        }))
    }
}

/// LXC container backing a proxmox route
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProxmoxTarget {
    pub node: String,
    pub vmid: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RouteConfig {
    /// http, https, tcp or udp
    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_host")]
    pub host: String,

    /// 0 while the published port is not known yet
    #[serde(default)]
    pub port: u16,

    /// Container name or id
    pub container: Option<String>,

    #[serde(default)]
    pub provider: ProviderKind,

    /// Docker daemon for this route, overriding `[docker] host`
    pub docker_host: Option<String>,

    /// Agent that relays docker calls and health probes
    pub agent: Option<String>,

    pub proxmox: Option<ProxmoxTarget>,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default)]
    pub health_use_get: bool,

    pub idlewatcher: Option<IdleOverrides>,
}

impl RouteConfig {
    pub fn is_stream(&self) -> bool {
        matches!(self.scheme.as_str(), "tcp" | "udp")
    }

    pub fn target_url(&self) -> Result<Url, String> {
        Url::parse(&format!("{}://{}:{}", self.scheme, self.host, self.port))
            .map_err(|e| format!("invalid target {}://{}:{}: {}", self.scheme, self.host, self.port, e))
    }

    pub fn proxy_target(&self) -> Result<ProxyTarget, String> {
        let url = self.target_url()?;
        Ok(if self.is_stream() {
            ProxyTarget::Stream(url)
        } else {
            ProxyTarget::ReverseProxy(url)
        })
    }

    pub fn agent_url(&self) -> Result<Option<Url>, String> {
        self.agent
            .as_deref()
            .map(|agent| Url::parse(agent).map_err(|e| format!("invalid agent url {:?}: {}", agent, e)))
            .transpose()
    }

    pub fn health_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            path: self.health_path.clone(),
            use_get: self.health_use_get,
            timeout: WAKE_PROBE_TIMEOUT,
        }
    }

    /// Identity of the watched container. Proxmox containers are known by
    /// their vmid.
    pub fn identity(&self) -> ContainerIdentity {
        match (&self.provider, &self.proxmox) {
            (ProviderKind::Proxmox, Some(target)) => {
                ContainerIdentity::new(target.vmid.to_string(), self.container.clone().unwrap_or_default())
            }
            _ => ContainerIdentity::new("", self.container.clone().unwrap_or_default()),
        }
    }

    pub fn has_container(&self) -> bool {
        self.container.is_some() || self.proxmox.is_some()
    }

    /// Resolved idle settings, or `None` when the route is not watched.
    pub fn idle_settings(&self, defaults: &IdleDefaults) -> Option<IdleSettings> {
        if !self.has_container() {
            return None;
        }
        let settings = self.resolve_settings(defaults);
        (!settings.idle_timeout.is_zero()).then_some(settings)
    }

    /// Settings for a route other routes depend on. Its own idle timer never
    /// runs; dependents stop it.
    pub fn dependency_settings(&self, defaults: &IdleDefaults) -> Option<IdleSettings> {
        self.has_container().then(|| IdleSettings {
            idle_timeout: Duration::ZERO,
            ..self.resolve_settings(defaults)
        })
    }

    /// Parsed `depends_on`, without empty or repeated entries
    pub fn dependencies(&self) -> Result<Vec<DependsOn>, String> {
        let mut deps: Vec<DependsOn> = Vec::new();
        for entry in self.idlewatcher.iter().flat_map(|o| o.depends_on.iter()) {
            if let Some(dep) = DependsOn::parse(entry)? {
                if !deps.iter().any(|d| d.route == dep.route) {
                    deps.push(dep);
                }
            }
        }
        Ok(deps)
    }

    fn resolve_settings(&self, defaults: &IdleDefaults) -> IdleSettings {
        let overrides = self.idlewatcher.clone().unwrap_or_default();
        let idle_timeout = overrides.idle_timeout_secs.unwrap_or(defaults.idle_timeout_secs);
        IdleSettings {
            idle_timeout: Duration::from_secs(idle_timeout),
            wake_timeout: Duration::from_secs(
                overrides.wake_timeout_secs.unwrap_or(defaults.wake_timeout_secs),
            ),
            stop_method: overrides.stop_method.unwrap_or(defaults.stop_method),
            stop_timeout: Duration::from_secs(
                overrides.stop_timeout_secs.unwrap_or(defaults.stop_timeout_secs),
            ),
            stop_signal: overrides.stop_signal.or_else(|| defaults.stop_signal.clone()),
        }
    }

    pub fn validate(&self, name: &str, proxmox_configured: bool) -> Result<(), String> {
        if !matches!(self.scheme.as_str(), "http" | "https" | "tcp" | "udp") {
            return Err(format!(
                "Route '{}': unsupported scheme '{}'",
                name, self.scheme
            ));
        }
        if let Err(e) = self.target_url() {
            return Err(format!("Route '{}': {}", name, e));
        }
        if let Err(e) = self.agent_url() {
            return Err(format!("Route '{}': {}", name, e));
        }

        match self.provider {
            ProviderKind::Docker if self.container.is_none() && self.idlewatcher.is_some() => {
                return Err(format!(
                    "Route '{}': idlewatcher requires 'container' field",
                    name
                ));
            }
            ProviderKind::Agent if self.agent.is_none() => {
                return Err(format!(
                    "Route '{}': agent provider requires 'agent' field",
                    name
                ));
            }
            ProviderKind::Proxmox if self.proxmox.is_none() => {
                return Err(format!(
                    "Route '{}': proxmox provider requires a [proxmox] table with node and vmid",
                    name
                ));
            }
            ProviderKind::Proxmox if !proxmox_configured => {
                return Err(format!(
                    "Route '{}': proxmox provider requires the top-level [proxmox] section",
                    name
                ));
            }
            _ => {}
        }

        if let Some(signal) = self
            .idlewatcher
            .as_ref()
            .and_then(|o| o.stop_signal.as_deref())
        {
            validate_stop_signal(signal).map_err(|e| format!("Route '{}': {}", name, e))?;
        }

        Ok(())
    }
}

pub fn validate_stop_signal(signal: &str) -> Result<(), String> {
    if signal.is_empty() || STOP_SIGNALS.contains(&signal) {
        Ok(())
    } else {
        Err(format!(
            "invalid stop_signal '{}', expected one of {}",
            signal,
            STOP_SIGNALS.join(", ")
        ))
    }
}

fn default_admin_port() -> u16 {
    9999
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_wake_timeout() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_health_path() -> String {
    "/".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Some(signal) = &self.idle_defaults.stop_signal {
            if let Err(e) = validate_stop_signal(signal) {
                errors.push(format!("idle_defaults: {}", e));
            }
        }

        let mut names: Vec<_> = self.routes.keys().collect();
        names.sort();
        for name in names {
            if let Err(e) = self.routes[name].validate(name, self.proxmox.is_some()) {
                errors.push(e);
            }
            errors.extend(self.validate_dependencies(name));
        }
        if let Err(e) = self.route_order() {
            errors.push(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    fn validate_dependencies(&self, name: &str) -> Vec<String> {
        let deps = match self.routes[name].dependencies() {
            Ok(deps) => deps,
            Err(e) => return vec![format!("Route '{}': {}", name, e)],
        };

        deps.iter()
            .filter_map(|dep| {
                let Some(target) = self.routes.get(&dep.route) else {
                    return Some(format!("dependency '{}' not found", dep.route));
                };
                if dep.route == name {
                    return Some(format!("dependency '{}' cannot be the route itself", dep.route));
                }
                if !target.has_container() {
                    return Some(format!("dependency '{}' has no container to wake", dep.route));
                }
                let own_timeout = target.idlewatcher.as_ref().and_then(|o| o.idle_timeout_secs);
                if own_timeout.is_some_and(|secs| secs > 0) {
                    return Some(format!("dependency '{}' has a positive idle timeout", dep.route));
                }
                None
            })
            .map(|e| format!("Route '{}': {}", name, e))
            .collect()
    }

    /// Routes that other routes depend on
    pub fn dependency_routes(&self) -> HashSet<String> {
        self.routes
            .values()
            .filter_map(|route| route.dependencies().ok())
            .flatten()
            .map(|dep| dep.route)
            .collect()
    }

    /// Route names ordered so that every dependency comes before its
    /// dependents. Fails on a dependency cycle.
    pub fn route_order(&self) -> Result<Vec<String>, String> {
        fn visit(
            config: &Config,
            name: &str,
            path: &mut Vec<String>,
            done: &mut HashSet<String>,
            order: &mut Vec<String>,
        ) -> Result<(), String> {
            if done.contains(name) {
                return Ok(());
            }
            if let Some(start) = path.iter().position(|p| p == name) {
                let mut cycle = path[start..].to_vec();
                cycle.push(name.to_string());
                return Err(format!("dependency cycle: {}", cycle.join(" -> ")));
            }
            let Some(route) = config.routes.get(name) else {
                return Ok(());
            };

            path.push(name.to_string());
            for dep in route.dependencies().unwrap_or_default() {
                visit(config, &dep.route, path, done, order)?;
            }
            path.pop();

            done.insert(name.to_string());
            order.push(name.to_string());
            Ok(())
        }

        let mut names: Vec<_> = self.routes.keys().cloned().collect();
        names.sort();
        let mut done = HashSet::new();
        let mut order = Vec::with_capacity(names.len());
        for name in &names {
            visit(self, name, &mut Vec::new(), &mut done, &mut order)?;
        }
        Ok(order)
    }
}
