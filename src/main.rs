use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use worldlink::commands::BasicCommands;
use worldlink::config::{ServerConfig, TransportKind};
use worldlink::hub::{Hub, HubHandle};
use worldlink::metrics::{self, Metrics};
use worldlink::net::transport::{TcpServer, WebTransportServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Worldlink Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    config.validate().map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    info!(
        "Configuration loaded: {}:{} ({:?}), outbound queue {}, ping every {:?}",
        config.bind_address,
        config.port,
        config.transport,
        config.connection.outbound_queue_capacity,
        config.connection.ping_interval
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Hub control loop with the reference command set
    let (hub, hub_task) = Hub::spawn(config.hub.clone(), metrics.clone(), Arc::new(BasicCommands));

    let server = serve(config.clone(), hub.clone());

    // Shutdown signal handler
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    // Run server with graceful shutdown
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {:#}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    // Close every connection and wait for the hub to stop
    if let Err(e) = hub.shutdown().await {
        error!("Hub shutdown: {}", e);
    }
    let _ = hub_task.await;

    info!(
        "Server stopped after {}s, {} connections served",
        metrics.uptime_seconds(),
        metrics.connections_total.load(std::sync::atomic::Ordering::Relaxed)
    );

    Ok(())
}

/// Run the configured listener until it fails
async fn serve(config: ServerConfig, hub: HubHandle) -> anyhow::Result<()> {
    match config.transport {
        TransportKind::WebTransport => {
            let server = WebTransportServer::new(config, hub).await?;
            info!(
                "Chrome flag: --ignore-certificate-errors-spki-list={}",
                server.cert_hash()
            );
            server.run().await
        }
        TransportKind::Tcp => {
            let addr = SocketAddr::new(config.bind_address, config.port);
            TcpServer::bind(addr, config.connection.clone(), hub).await?.run().await
        }
    }
}
