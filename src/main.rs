use appdock::api::ApiServer;
use appdock::config::Config;
use appdock::estate::AppEstate;
use appdock::proxy::ProxyServer;
use appdock::routing::RoutingTable;
use appdock::runner::RunnerRegistry;
use appdock::sandbox::FileSandbox;
use appdock::store::FileRepoLoader;
use appdock::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("appdock=debug".parse().expect("valid log directive")),
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

    info!(
        name = PKG_NAME,
        version = VERSION,
        path = %config_path.display(),
        "Starting app host"
    );
    info!(
        bind = %config.server.bind,
        proxy_port = config.server.proxy_port,
        api_port = config.server.api_port,
        data_dir = %config.data_dir.display(),
        default_app = config.default_app.as_deref(),
        "Server configuration"
    );

    let sandbox = FileSandbox::new(&config.data_dir).map_err(|e| {
        error!(dir = %config.data_dir.display(), error = %e, "Failed to create data directories");
        anyhow::anyhow!("Failed to create data directories: {}", e)
    })?;

    let routing = Arc::new(RoutingTable::new());
    let registry = Arc::new(RunnerRegistry::with_defaults(config.defaults.clone()));
    info!("Available runners:\n{}", registry.describe().await);

    let loader = Arc::new(FileRepoLoader::new(sandbox.registry_file()));
    let estate = Arc::new(AppEstate::new(
        Arc::clone(&routing),
        registry,
        sandbox,
        loader,
        config.defaults.clone(),
    ));

    // Bring previously registered apps back up, default landing app first
    estate.load_registered().await;
    for manager in estate.apps_by_startup_order(config.default_app.as_deref()) {
        info!(app = %manager.name(), "Deploying at startup");
        if let Err(e) = manager.deploy(None).await {
            warn!(app = %manager.name(), error = %e, "Startup deploy failed; app stays unavailable until redeployed");
        }
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_addr: SocketAddr =
        format!("{}:{}", config.server.bind, config.server.proxy_port).parse()?;
    let proxy = ProxyServer::bind(
        proxy_addr,
        Arc::clone(&routing),
        config.defaults.request_timeout(),
        shutdown_rx.clone(),
    )
    .await?;
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let api_addr: SocketAddr =
        format!("{}:{}", config.server.bind, config.server.api_port).parse()?;
    let api = Arc::new(
        ApiServer::bind(
            api_addr,
            Arc::clone(&estate),
            config.server.proxy_port,
            shutdown_rx.clone(),
        )
        .await?,
    );
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and stop every app
    let _ = shutdown_tx.send(true);
    info!("Stopping all apps...");
    estate.shutdown_all().await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = api_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}
