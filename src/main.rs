use previewd::config::Config;
use previewd::pool::PoolConfig;
use previewd::proxy::Proxy;
use previewd::reaper::run_reaper;
use previewd::registry::Registry;
use previewd::router::Router;
use previewd::server::PreviewServer;
use previewd::shutdown::{drain, wait_for_signal};
use previewd::supervisor::Supervisor;
use previewd::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Config file used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "previewd.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("previewd=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config()?;
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    };
    let registry = Arc::new(Registry::new());
    let proxy = Arc::new(Proxy::new(pool_config, config.server.request_timeout()));
    let router = Arc::new(Router::new(
        &config.server.route_prefix,
        Arc::clone(&registry),
        proxy,
        config.keepalive.ping_interval(),
    ));
    let supervisor = Arc::new(Supervisor::new(
        registry,
        router,
        config.runner.clone(),
        config.projects.clone(),
    ));

    // Bind before spawning so a taken port fails startup
    let server = PreviewServer::new(Arc::clone(&supervisor), config.server.clone(), shutdown_rx.clone());
    let listener = server.bind().await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!(error = %e, "Preview server error");
        }
    });

    // Spawn reaper
    let reaper_handle = tokio::spawn(run_reaper(
        Arc::clone(&supervisor),
        config.keepalive.sweep_interval(),
        config.keepalive.stale_after(),
        shutdown_rx,
    ));

    if let Err(e) = wait_for_signal().await {
        error!(error = %e, "Failed to listen for shutdown signals");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all preview instances...");
    drain(&supervisor, config.runner.shutdown_grace_period()).await;

    // Wait for background tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = reaper_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Load from the first argument, else `previewd.toml` if present, else defaults
fn load_config() -> anyhow::Result<Config> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if explicit.is_none() && !Path::new(&config_path).exists() {
        warn!(path = %config_path.display(), "No configuration file found, using defaults");
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");
    Ok(config)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting preview server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        public_url = %config.server.public_base_url(),
        route_prefix = %config.server.route_prefix,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        projects_dir = %config.projects.dir.display(),
        command = %config.runner.command,
        args = ?config.runner.args,
        first_port = config.runner.first_port,
        rules = config.runner.rules.len(),
        "Runner settings"
    );
    info!(
        startup_timeout_secs = config.runner.startup_timeout_secs,
        shutdown_grace_period_secs = config.runner.shutdown_grace_period_secs,
        "Lifecycle settings"
    );
    info!(
        ping_interval_secs = config.keepalive.ping_interval_secs,
        stale_after_secs = config.keepalive.stale_after_secs,
        sweep_interval_secs = config.keepalive.sweep_interval_secs,
        "Keepalive settings"
    );
}
