//! Walks a server through initialize, tool discovery and a few calls.

use anyhow::{Context, Result};
use clap::Parser;
use mcp_core::protocol::ServerInfo;
use mcp_core::{Client, ClientError, Transport};
use mcp_server::client_transport::{
    ChildProcessTransport, HttpStreamsClientTransport, SseClientTransport,
};
use mcp_server::config::{ClientArgs, TransportKind};
use mcp_server::logging::init_tracing;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ClientArgs::parse();
    init_tracing(args.debug);

    let transport: Arc<dyn Transport> = match args.transport {
        TransportKind::Stdio => Arc::new(ChildProcessTransport::spawn(&args.command)?),
        TransportKind::Sse => Arc::new(SseClientTransport::new(args.base_url()?)),
        TransportKind::HttpStreams => Arc::new(HttpStreamsClientTransport::new(&args.base_url()?)?),
    };

    let client = Arc::new(Client::new(transport));
    client
        .start(CancellationToken::new())
        .await
        .context("Failed to connect to server")?;

    let outcome = run(&client, args.timeout()).await;
    client.close().await?;
    outcome
}

async fn within<T>(
    timeout: Duration,
    what: &str,
    call: impl std::future::Future<Output = Result<T, ClientError>>,
) -> Result<T> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ClientError::Timeout(timeout))
        .and_then(|r| r)
        .with_context(|| format!("{} failed", what))
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn run(client: &Client, timeout: Duration) -> Result<()> {
    let info = ServerInfo {
        name: env!("CARGO_BIN_NAME").into(),
        version: env!("CARGO_PKG_VERSION").into(),
    };
    let init = within(timeout, "initialize", client.initialize(info)).await?;
    println!(
        "Connected to {} {} (protocol {})",
        init.server_info.name, init.server_info.version, init.protocol_version
    );

    let tools = within(timeout, "tools/list", client.list_tools()).await?;
    println!("Tools:");
    for tool in &tools {
        println!("  {} - {}", tool.name, tool.description);
    }

    if tools.iter().any(|t| t.name == "echo") {
        let result = within(
            timeout,
            "echo",
            client.call_tool("echo", object(json!({ "message": "Hello from mcp-client" }))),
        )
        .await?;
        println!("echo -> {}", serde_json::to_string(&result.content)?);
    }
    if tools.iter().any(|t| t.name == "math") {
        let result = within(
            timeout,
            "math",
            client.call_tool("math", object(json!({ "operation": "divide", "a": 22, "b": 7 }))),
        )
        .await?;
        println!("math 22/7 -> {}", serde_json::to_string(&result.content)?);
    }

    client
        .notify(
            "notifications/message",
            Some(json!({ "level": "info", "message": "client finished calls", "source": "mcp-client" })),
        )
        .await?;

    let response = client.call_with_timeout("nonexistent", None, timeout).await?;
    match response.into_result() {
        Ok(value) => println!("nonexistent -> {}", value),
        Err(err) => println!("nonexistent -> error {}: {}", err.code, err.message),
    }

    info!("Done");
    Ok(())
}
