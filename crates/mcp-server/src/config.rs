//! Command-line and file configuration for the two binaries.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use mcp_core::protocol::ServerInfo;
use mcp_core::transport::TransportOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Line-delimited JSON on stdin/stdout.
    #[default]
    Stdio,
    /// `/sse` event stream plus `/message` posts.
    Sse,
    /// Session-header protocol on `/mcp`.
    HttpStreams,
}

#[derive(Parser, Debug, Default)]
#[command(name = "mcp-server", version, about = "MCP server over stdio, SSE or HTTP-Streams")]
pub struct ServerArgs {
    /// Transport to serve.
    #[arg(long, value_enum, env = "MCP_TRANSPORT")]
    pub transport: Option<TransportKind>,

    /// Listen address for HTTP transports: `8080`, `:8080` or `host:port`.
    #[arg(long, env = "MCP_ADDR")]
    pub addr: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    pub debug: bool,

    /// TOML file with defaults; flags override it.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub transport: Option<TransportKind>,
    pub addr: Option<String>,
    pub queue_capacity: Option<usize>,
    pub shutdown_timeout_ms: Option<u64>,
    pub attach_timeout_ms: Option<u64>,
    pub server_name: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Resolved server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub transport: TransportKind,
    pub addr: String,
    pub debug: bool,
    pub options: TransportOptions,
    pub server_info: ServerInfo,
}

impl Config {
    pub fn load(args: ServerArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::from_parts(args, file)
    }

    pub fn from_parts(args: ServerArgs, file: FileConfig) -> Result<Self> {
        let mut options = TransportOptions::default();
        if let Some(capacity) = file.queue_capacity {
            if capacity == 0 {
                bail!("queue_capacity must be at least 1");
            }
            options.queue_capacity = capacity;
        }
        if let Some(ms) = file.shutdown_timeout_ms {
            options.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.attach_timeout_ms {
            if ms == 0 {
                bail!("attach_timeout_ms must be at least 1");
            }
            options.attach_timeout = Duration::from_millis(ms);
        }

        let mut server_info = ServerInfo::default();
        if let Some(name) = file.server_name {
            server_info.name = name;
        }

        let addr = args
            .addr
            .or(file.addr)
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());

        Ok(Self {
            transport: args.transport.or(file.transport).unwrap_or_default(),
            addr: normalize_addr(&addr),
            debug: args.debug,
            options,
            server_info,
        })
    }
}

/// `8080` and `:8080` listen on every interface; anything else is used as is.
pub fn normalize_addr(addr: &str) -> String {
    let addr = addr.trim();
    let port = addr.strip_prefix(':').unwrap_or(addr);
    if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

#[derive(Parser, Debug)]
#[command(name = "mcp-client", version, about = "Exercise an MCP server over any transport")]
pub struct ClientArgs {
    #[arg(long, value_enum, default_value = "stdio")]
    pub transport: TransportKind,

    /// Server base URL for HTTP transports (`http://host:port`, `host:port` or `:port`).
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Server command to spawn for the stdio transport.
    #[arg(long, default_value = "mcp-server --transport stdio")]
    pub command: String,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    #[arg(long)]
    pub debug: bool,
}

impl ClientArgs {
    pub fn base_url(&self) -> Result<Url> {
        let addr = self.addr.trim();
        let addr = if addr.starts_with(':') {
            format!("127.0.0.1{}", addr)
        } else {
            addr.to_string()
        };
        let addr = if addr.contains("://") {
            addr
        } else {
            format!("http://{}", addr)
        };
        Url::parse(&addr).with_context(|| format!("Invalid server address {}", self.addr))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}
