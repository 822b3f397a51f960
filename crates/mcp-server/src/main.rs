use anyhow::{Context, Result};
use clap::Parser;
use mcp_core::{Server, Transport};
use mcp_server::config::{Config, ServerArgs, TransportKind};
use mcp_server::logging::init_tracing;
use mcp_server::tools::{demo_tools, register_legacy_handlers};
use mcp_server::transport::{HttpStreamsTransport, LineStreamTransport, SseTransport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(ServerArgs::parse())?;
    init_tracing(config.debug);

    info!(
        transport = ?config.transport,
        addr = %config.addr,
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let transport: Arc<dyn Transport> = match config.transport {
        TransportKind::Stdio => Arc::new(LineStreamTransport::with_options(
            tokio::io::stdin(),
            tokio::io::stdout(),
            config.options,
        )),
        TransportKind::Sse => Arc::new(SseTransport::with_options(config.addr.clone(), config.options)),
        TransportKind::HttpStreams => Arc::new(HttpStreamsTransport::with_options(
            config.addr.clone(),
            config.options,
        )),
    };

    let server = Arc::new(
        Server::new(transport)
            .with_info(config.server_info.clone())
            .with_tools(Arc::new(demo_tools())),
    );
    register_legacy_handlers(&server);

    let token = CancellationToken::new();
    server
        .start(token.clone())
        .await
        .context("Failed to start server")?;

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = server.wait() => info!("Transport finished"),
    }

    token.cancel();
    if let Err(e) = server.stop().await {
        warn!(error = %e, "Server did not stop cleanly");
    }
    server.close().await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
