use routegate::api::{ApiServer, PKG_NAME, VERSION};
use routegate::config::{Config, StoreKind};
use routegate::reconciler::Reconciler;
use routegate::store::{KubeStore, MemoryStore, ResourceStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Default config file, used when present and no path is given
const DEFAULT_CONFIG_PATH: &str = "routegate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration: explicit path, then ./routegate.toml, then env only
    let config_path = std::env::args().nth(1).map(PathBuf::from).or_else(|| {
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        default.exists().then_some(default)
    });

    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded from environment"),
    }

    print_startup_banner(&config);

    let store: Arc<dyn ResourceStore> = match config.store.kind {
        StoreKind::Kubernetes => Arc::new(KubeStore::from_config(&config.store).map_err(|e| {
            error!(error = %e, "Failed to set up Kubernetes client");
            e
        })?),
        StoreKind::Memory => {
            warn!("Using in-memory routing store, routes are not published to the mesh");
            Arc::new(MemoryStore::new())
        }
    };

    let reconciler = Reconciler::new(&config, store);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid API bind address");
            anyhow::anyhow!("Invalid API bind address: {}", e)
        })?;

    let api_server = ApiServer::new(
        api_addr,
        Arc::clone(&reconciler),
        shutdown_rx,
        config.server.api_token.clone(),
    );

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "Route API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Stop accepting requests
    let _ = shutdown_tx.send(true);

    let grace = config.server.shutdown_grace_period();
    info!(in_flight = reconciler.in_flight(), grace_secs = grace.as_secs(), "Draining route operations...");
    if reconciler.drain(grace).await {
        info!("All route operations finished");
    } else {
        warn!(in_flight = reconciler.in_flight(), "Route operations aborted at shutdown");
    }

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting route API");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        shutdown_grace_period_secs = config.server.shutdown_grace_period_secs,
        "Server configuration"
    );
    info!(
        gateway = %config.mesh.gateway,
        namespace = %config.mesh.namespace,
        sub_domain_host = %config.mesh.sub_domain_host,
        resource_name_prefix = %config.mesh.resource_name_prefix,
        cluster_domain = %config.mesh.cluster_domain,
        base_url = ?config.mesh.base_url,
        "Mesh settings"
    );
    info!(
        wait_for_warmup = config.mesh.wait_for_warmup,
        warmup_timeout_secs = config.reconcile.warmup_timeout_secs,
        max_retries = config.reconcile.max_retries,
        backoff_base_ms = config.reconcile.backoff_base_ms,
        backoff_max_ms = config.reconcile.backoff_max_ms,
        "Reconcile policy"
    );
    info!(store = ?config.store.kind, "Routing store");
}
