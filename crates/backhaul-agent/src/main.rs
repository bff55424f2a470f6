//! Backhaul Agent - on-premise file agent CLI
//!
//! Connects out to a coordinator and serves file requests over the tunnel.

use anyhow::{Context, Result};
use backhaul_agent::{
    Agent, AgentConfig, EmitterConfig, ReconnectConfig, DEFAULT_CHUNK_PACING,
};
use backhaul_proto::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use backhaul_transport_websocket::ClientTlsConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul agent - serves files to a cloud coordinator over an outbound tunnel
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(version)]
#[command(long_about = r#"
Backhaul Agent opens an outbound WebSocket tunnel to a coordinator and
sends files from this host when the coordinator asks for them.

EXAMPLES:
  # Plain tunnel for local testing
  backhaul-agent --server-url ws://localhost:8080 --client-id site-1

  # Mutual TLS (the client id must match the certificate CN)
  backhaul-agent --server-url wss://coordinator.example.com:8443 \
    --client-id site-1 \
    --ca-cert ca.pem --client-cert site-1.pem --client-key site-1.key

  # Start agent using config file
  backhaul-agent --config agent.yaml

ENVIRONMENT VARIABLES:
  BACKHAUL_SERVER_URL   Coordinator tunnel URL
  BACKHAUL_CLIENT_ID    Client identity
  BACKHAUL_CA_CERT      CA bundle for the coordinator certificate
  BACKHAUL_CLIENT_CERT  Client certificate (PEM)
  BACKHAUL_CLIENT_KEY   Client private key (PEM)
"#)]
struct Args {
    /// Coordinator tunnel URL (ws://host:port or wss://host:port)
    #[arg(long, env = "BACKHAUL_SERVER_URL")]
    server_url: Option<String>,

    /// Client identity (auto-generated if not specified)
    #[arg(long, env = "BACKHAUL_CLIENT_ID")]
    client_id: Option<String>,

    /// CA certificate used to verify the coordinator
    #[arg(long, env = "BACKHAUL_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Client certificate for mutual TLS
    #[arg(long, env = "BACKHAUL_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Client private key for mutual TLS
    #[arg(long, env = "BACKHAUL_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Chunk size in bytes
    #[arg(long, env = "BACKHAUL_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Pause between chunks in milliseconds
    #[arg(long, env = "BACKHAUL_CHUNK_PACING_MS")]
    pacing_ms: Option<u64>,

    /// Only serve files under this directory (repeatable)
    #[arg(long = "allowed-root")]
    allowed_roots: Vec<PathBuf>,

    /// Consecutive reconnection attempts before exiting
    #[arg(long, env = "BACKHAUL_MAX_RECONNECT_ATTEMPTS")]
    max_reconnect_attempts: Option<usize>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,

    #[serde(default)]
    agent: AgentSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    ca_cert: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    client_cert: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    client_key: Option<PathBuf>,

    #[serde(default)]
    insecure: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pacing_ms: Option<u64>,

    #[serde(default)]
    allowed_roots: Vec<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_reconnect_attempts: Option<usize>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_agent_config(args: Args) -> Result<AgentConfig> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let server_url = args
        .server_url
        .or(file.server.url)
        .context("Server URL is required (use --server-url or config file)")?;
    validate_server_url(&server_url)?;

    let client_id = args.client_id.or(file.agent.client_id).unwrap_or_else(|| {
        let id = format!("agent-{}", uuid::Uuid::new_v4());
        info!("Auto-generated client ID: {}", id);
        id
    });

    let tls = ClientTlsConfig {
        ca_cert_path: args.ca_cert.or(file.server.ca_cert),
        client_cert_path: args.client_cert.or(file.server.client_cert),
        client_key_path: args.client_key.or(file.server.client_key),
        insecure_skip_verify: args.insecure || file.server.insecure,
    };
    if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
        anyhow::bail!("--client-cert and --client-key must be given together");
    }
    if tls.insecure_skip_verify {
        warn!("Certificate verification is disabled");
    }

    let chunk_size = args
        .chunk_size
        .or(file.agent.chunk_size)
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        anyhow::bail!(
            "Chunk size must be between 1 and {} bytes, got {}",
            MAX_CHUNK_SIZE,
            chunk_size
        );
    }
    let pacing = args
        .pacing_ms
        .or(file.agent.pacing_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_CHUNK_PACING);

    let allowed_roots = if args.allowed_roots.is_empty() {
        file.agent.allowed_roots
    } else {
        args.allowed_roots
    };

    let mut reconnect = ReconnectConfig::default();
    if let Some(max) = args
        .max_reconnect_attempts
        .or(file.agent.max_reconnect_attempts)
    {
        reconnect.max_attempts = Some(max);
    }

    Ok(AgentConfig {
        client_id,
        server_url,
        tls,
        emitter: EmitterConfig { chunk_size, pacing },
        allowed_roots,
        reconnect,
    })
}

/// Validate the coordinator URL (ws:// or wss:// with host and port)
fn validate_server_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .with_context(|| format!("Invalid server URL '{}' (expected ws:// or wss://)", url))?;

    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = authority
        .rsplit_once(':')
        .with_context(|| format!("Invalid server URL '{}' (expected host:port)", url))?;

    if host.is_empty() {
        anyhow::bail!("Invalid server URL '{}' (host cannot be empty)", url);
    }
    port.parse::<u16>()
        .with_context(|| format!("Invalid port in server URL: {}", url))?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Backhaul Agent starting...");

    let config = build_agent_config(args).context("Failed to build agent configuration")?;

    info!("Client ID: {}", config.client_id);
    info!("Coordinator: {}", config.server_url);
    if !config.allowed_roots.is_empty() {
        info!("Allowed roots: {:?}", config.allowed_roots);
    }

    let agent = Agent::new(config).context("Failed to create agent")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = agent.run() => {
            if let Err(e) = result {
                error!("Agent error: {}", e);
                return Err(e.into());
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["backhaul-agent"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_validate_server_url() {
        assert!(validate_server_url("ws://localhost:8080").is_ok());
        assert!(validate_server_url("wss://coordinator.example.com:8443/tunnel").is_ok());

        assert!(validate_server_url("http://localhost:8080").is_err());
        assert!(validate_server_url("ws://localhost").is_err());
        assert!(validate_server_url("ws://:8080").is_err());
        assert!(validate_server_url("ws://localhost:abc").is_err());
        assert!(validate_server_url("").is_err());
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        fs::write(
            &path,
            "server:\n  url: ws://file-host:9000\nagent:\n  client_id: from-file\n  chunk_size: 1024\n",
        )
        .unwrap();

        let config = build_agent_config(args(&[
            "--config",
            path.to_str().unwrap(),
            "--client-id",
            "from-cli",
        ]))
        .unwrap();

        assert_eq!(config.client_id, "from-cli");
        assert_eq!(config.server_url, "ws://file-host:9000");
        assert_eq!(config.emitter.chunk_size, 1024);
        assert_eq!(config.reconnect.max_attempts, Some(5));
    }

    #[test]
    fn test_requires_server_url() {
        assert!(build_agent_config(args(&["--client-id", "site-1"])).is_err());
    }

    #[test]
    fn test_chunk_size_bounds() {
        let too_big = (MAX_CHUNK_SIZE + 1).to_string();
        for size in ["0", too_big.as_str()] {
            let result = build_agent_config(args(&[
                "--server-url",
                "ws://localhost:8080",
                "--chunk-size",
                size,
            ]));
            assert!(result.is_err(), "chunk size {} accepted", size);
        }
    }

    #[test]
    fn test_client_cert_requires_key() {
        let result = build_agent_config(args(&[
            "--server-url",
            "wss://localhost:8443",
            "--client-cert",
            "site-1.pem",
        ]));
        assert!(result.is_err());
    }
}
