use napgate::admin::{AdminServer, PKG_NAME, VERSION};
use napgate::config::Config;
use napgate::docker::DockerClientPool;
use napgate::routes::{DefaultProviders, RouteProvider};
use napgate::task::Root;
use napgate::watcher::WatcherRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("napgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let root = Root::new();

    let docker = DockerClientPool::new();
    docker.start_cleaner(root.task());

    let registry = WatcherRegistry::new();
    let routes = RouteProvider::new(
        root.task(),
        Arc::clone(&registry),
        Arc::new(DefaultProviders::new(Arc::clone(&docker))),
    );

    let applied = routes.apply_config(&config).await;
    info!(
        watchers = registry.len(),
        routes = ?applied.added,
        "Idle watchers registered"
    );

    if config.server.admin_port > 0 {
        let admin_addr: SocketAddr =
            format!("{}:{}", config.server.bind, config.server.admin_port).parse()?;

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        AdminServer::new(admin_addr, Arc::clone(&routes), admin_token)
            .start(root.task())
            .await?;
    }

    spawn_config_reloader(&root, Arc::clone(&routes), config_path);

    root.on_program_exit("exit_log", || info!("All tasks finished"));

    root.wait_exit(config.server.shutdown_timeout()).await?;
    info!("Shutdown complete");
    Ok(())
}

/// Reload routes on SIGHUP until the root is cancelled
#[cfg(unix)]
fn spawn_config_reloader(root: &Root, routes: Arc<RouteProvider>, path: PathBuf) {
    use napgate::task::Cause;
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::warn;

    let task = root.subtask("config_reloader", true);
    tokio::spawn(async move {
        match signal(SignalKind::hangup()) {
            Ok(mut sighup) => loop {
                tokio::select! {
                    _ = task.cancelled() => break,
                    _ = sighup.recv() => {
                        info!(path = %path.display(), "Received SIGHUP, reloading configuration");
                        match routes.reload(&path).await {
                            Ok(result) => info!(
                                added = ?result.added,
                                removed = ?result.removed,
                                updated = ?result.updated,
                                "Configuration reloaded"
                            ),
                            Err(e) => error!(error = %e, "Failed to reload configuration, keeping current routes"),
                        }
                    }
                }
            },
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGHUP, configuration reload disabled");
                task.cancelled().await;
            }
        }
        task.finish(task.finish_cause().unwrap_or(Cause::Canceled)).await;
    });
}

#[cfg(not(unix))]
fn spawn_config_reloader(_root: &Root, _routes: Arc<RouteProvider>, _path: PathBuf) {}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting idle watcher");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        shutdown_timeout_secs = config.server.shutdown_timeout_secs,
        docker_host = config.docker.host.as_deref().unwrap_or("default"),
        proxmox = config.proxmox.is_some(),
        "Server configuration"
    );
    info!(
        idle_timeout_secs = config.idle_defaults.idle_timeout_secs,
        wake_timeout_secs = config.idle_defaults.wake_timeout_secs,
        stop_timeout_secs = config.idle_defaults.stop_timeout_secs,
        stop_method = %config.idle_defaults.stop_method,
        "Idle defaults"
    );
    let mut names: Vec<_> = config.routes.keys().collect();
    names.sort();
    info!(route_count = names.len(), routes = ?names, "Configured routes");
}
