use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tinyhook::config::Config;
use tinyhook::deploy::Deployer;
use tinyhook::dispatcher::Dispatcher;
use tinyhook::health::{HealthMonitor, HealthSettings};
use tinyhook::hook::HookServer;
use tinyhook::logs::prepare_directories;
use tinyhook::pool::{ConnectionPool, PoolConfig};
use tinyhook::process::{Supervisor, SupervisorSettings};
use tinyhook::proxy::ProxyServer;
use tinyhook::registry::AppRegistry;
use tinyhook::runtime::RuntimeRegistry;
use tinyhook::{PKG_NAME, VERSION};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// How long stopped listeners and aborted deploys get to unwind
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type ListenerExit = (&'static str, anyhow::Result<()>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tinyhook=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tinyhook.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    prepare_directories(&config.server.directory).map_err(|e| {
        error!(directory = %config.server.directory.display(), error = %e, "Failed to prepare base directory");
        e
    })?;

    print_startup_banner(&config);

    let hook_addr = bind_addr(&config.server.bind, config.server.hook_port)?;
    let proxy_addr = bind_addr(&config.server.bind, config.server.proxy_port)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let apps = Arc::new(AppRegistry::from_config(&config));
    let runtime = Arc::new(RuntimeRegistry::new());
    let supervisor = Supervisor::new(
        Arc::clone(&apps),
        Arc::clone(&runtime),
        SupervisorSettings::from_config(&config),
    );

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    }));

    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&apps),
        Arc::clone(&runtime),
        Arc::clone(&pool),
        HealthSettings::from_config(&config),
        shutdown_rx.clone(),
    ));

    let deployer = Deployer::new(Arc::clone(&supervisor), monitor);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&apps),
        Arc::new(deployer.clone()),
    ));

    let hook_server = HookServer::new(hook_addr, dispatcher, shutdown_rx.clone());
    let proxy_server = ProxyServer::new(
        proxy_addr,
        Arc::clone(&apps),
        Arc::clone(&runtime),
        pool,
        config.defaults.request_timeout(),
        shutdown_rx.clone(),
    );

    // Either listener returning before shutdown ends the daemon
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel::<ListenerExit>();

    let hook_handle = {
        let stopped_tx = stopped_tx.clone();
        tokio::spawn(async move {
            let result = hook_server.run().await;
            let _ = stopped_tx.send(("webhook", result));
        })
    };
    let proxy_handle = tokio::spawn(async move {
        let result = proxy_server.run().await;
        let _ = stopped_tx.send(("proxy", result));
    });

    // Builds can take minutes; the listeners are already up
    deployer.spawn_initial_deploys();

    let listener_failure = tokio::select! {
        signal = shutdown_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Received signal, shutting down..."),
                Err(e) => error!(error = %e, "Failed to listen for signals, shutting down..."),
            }
            None
        }
        Some((listener, result)) = stopped_rx.recv() => {
            let err = match result {
                Ok(()) => anyhow::anyhow!("{} listener stopped unexpectedly", listener),
                Err(e) => e.context(format!("{} listener failed", listener)),
            };
            error!(listener, error = %err, "Listener stopped, shutting down...");
            Some(err)
        }
    };

    let _ = shutdown_tx.send(true);

    deployer.shutdown(SHUTDOWN_TIMEOUT).await;

    info!("Stopping all apps...");
    supervisor.stop_all().await;

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = hook_handle.await;
        let _ = proxy_handle.await;
    })
    .await;

    match listener_failure {
        Some(err) => Err(err),
        None => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address '{}:{}': {}", bind, port, e)
    })
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting deploy daemon");
    info!(
        bind = %config.server.bind,
        hook_port = config.server.hook_port,
        proxy_port = config.server.proxy_port,
        directory = %config.server.directory.display(),
        git = %config.server.git,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        startup_timeout_secs = config.defaults.startup_timeout_secs,
        startup_poll_interval_ms = config.defaults.startup_poll_interval_ms,
        startup_max_poll_interval_ms = config.defaults.startup_max_poll_interval_ms,
        heartbeat_interval_secs = config.defaults.heartbeat_interval_secs,
        probe_timeout_ms = config.defaults.probe_timeout_ms,
        "Health check settings"
    );
    info!(
        request_timeout_secs = config.defaults.request_timeout_secs,
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        "Request and shutdown settings"
    );
    info!(
        app_count = config.apps.len(),
        apps = ?config.apps.keys().collect::<Vec<_>>(),
        hosts = ?config.hosts,
        "Configured apps"
    );
}
