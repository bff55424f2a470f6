//! Backhaul coordinator
//!
//! Accepts agent tunnels, tracks sessions and transfers, and serves the HTTP
//! API used to request files from agents.

use anyhow::{Context, Result};
use backhaul_api::{ApiServer, ApiServerConfig};
use backhaul_control::{
    spawn_reconcile_task, spawn_transfer_reaper, HandlerConfig, SessionRegistry, TransferConfig,
    TransferCoordinator, TransferService, TunnelHandler,
};
use backhaul_transport_websocket::{ServerTlsConfig, TunnelListener};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

const REAPER_PERIOD: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "backhaul",
    about = "Backhaul coordinator - pulls files from on-premise agents over their tunnels",
    version = VERSION,
    long_about = "Agents behind NAT dial out to the coordinator and keep a WebSocket\n\
                  tunnel open. The coordinator asks them for files over that tunnel\n\
                  and writes what they send under the download directory.\n\n\
                  Examples:\n  \
                  # Plain tunnels, in-memory state\n  \
                  backhaul --listen 0.0.0.0:8080\n\n  \
                  # Mutual TLS with Redis-mirrored state\n  \
                  backhaul \\\n    \
                  --listen 0.0.0.0:8443 \\\n    \
                  --cert server.pem --key server.key --client-ca ca.pem \\\n    \
                  --store-url redis://127.0.0.1:6379"
)]
struct Cli {
    /// Listen address for agent tunnels
    #[arg(
        short = 'l',
        long,
        default_value = "0.0.0.0:8080",
        env = "BACKHAUL_LISTEN"
    )]
    listen: SocketAddr,

    /// Listen address for the HTTP API
    #[arg(long, default_value = "127.0.0.1:3000", env = "BACKHAUL_API_LISTEN")]
    api_listen: SocketAddr,

    /// TLS certificate path (enables wss://)
    #[arg(long, env = "BACKHAUL_CERT", requires = "key")]
    cert: Option<PathBuf>,

    /// TLS key path
    #[arg(long, env = "BACKHAUL_KEY", requires = "cert")]
    key: Option<PathBuf>,

    /// CA for client certificates (enables mutual TLS)
    #[arg(long, env = "BACKHAUL_CLIENT_CA", requires = "cert")]
    client_ca: Option<PathBuf>,

    /// Session/transfer mirror: redis://host:port or "memory"
    #[arg(long, default_value = "memory", env = "BACKHAUL_STORE_URL")]
    store_url: String,

    /// Directory for assembled files
    #[arg(long, default_value = "downloads", env = "BACKHAUL_DOWNLOAD_DIR")]
    download_dir: PathBuf,

    /// TTL of an agent's liveness marker, in seconds
    #[arg(long, default_value_t = 60, env = "BACKHAUL_LIVENESS_TTL")]
    liveness_ttl: u64,

    /// How often registered agents refresh their liveness marker, in seconds
    #[arg(long, default_value_t = 20, env = "BACKHAUL_HEARTBEAT_INTERVAL")]
    heartbeat_interval: u64,

    /// Fail transfers whose final chunk arrives with chunks missing
    #[arg(long, env = "BACKHAUL_STRICT_COMPLETION")]
    strict_completion: bool,

    /// Fail transfers idle for this many seconds (off by default)
    #[arg(long, env = "BACKHAUL_TRANSFER_TIMEOUT")]
    transfer_timeout: Option<u64>,

    /// How often the session mirror is reconciled, in seconds
    #[arg(long, default_value_t = 30, env = "BACKHAUL_RECONCILE_INTERVAL")]
    reconcile_interval: u64,

    /// Allow browser requests to the API from localhost origins
    #[arg(long)]
    cors: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "backhaul=debug,backhaul_control=debug,backhaul_transport_websocket=debug,backhaul_api=debug,tower_http=debug".into()
        })
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .init();
}

fn validate(cli: &Cli) -> Result<()> {
    if cli.liveness_ttl == 0 || cli.heartbeat_interval == 0 {
        anyhow::bail!("--liveness-ttl and --heartbeat-interval must be greater than zero");
    }
    if cli.heartbeat_interval >= cli.liveness_ttl {
        anyhow::bail!(
            "--heartbeat-interval ({}s) must be shorter than --liveness-ttl ({}s)",
            cli.heartbeat_interval,
            cli.liveness_ttl
        );
    }
    if cli.transfer_timeout == Some(0) {
        anyhow::bail!("--transfer-timeout must be greater than zero");
    }
    if cli.reconcile_interval == 0 {
        anyhow::bail!("--reconcile-interval must be greater than zero");
    }
    Ok(())
}

/// Accept tunnels forever, one task per connection
async fn serve_tunnels(listener: TunnelListener, handler: Arc<TunnelHandler>) -> Result<()> {
    loop {
        let incoming = match listener.accept().await {
            Ok(incoming) => incoming,
            Err(e) => {
                error!("Failed to accept tunnel connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            let remote_addr = incoming.remote_addr();
            let tunnel = match incoming.establish().await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    debug!("Dropping connection from {}: {}", remote_addr, e);
                    return;
                }
            };

            if let Err(e) = handler
                .handle_connection(tunnel.websocket, tunnel.peer, tunnel.remote_addr)
                .await
            {
                warn!("Tunnel from {} closed: {}", remote_addr, e);
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    validate(&cli)?;

    info!("Starting Backhaul coordinator {}", VERSION);
    info!("Tunnel listen: {}", cli.listen);
    info!("API listen: {}", cli.api_listen);
    info!("Download directory: {}", cli.download_dir.display());

    let store = backhaul_store::connect(&cli.store_url)
        .await
        .with_context(|| format!("Failed to connect to store '{}'", cli.store_url))?;

    let registry = Arc::new(
        SessionRegistry::new(store.clone())
            .with_liveness_ttl(Duration::from_secs(cli.liveness_ttl)),
    );
    let transfers = Arc::new(TransferCoordinator::new(
        store,
        TransferConfig {
            download_dir: cli.download_dir.clone(),
            strict_completion: cli.strict_completion,
            transfer_timeout: cli.transfer_timeout.map(Duration::from_secs),
        },
    ));
    let handler = Arc::new(
        TunnelHandler::new(registry.clone(), transfers.clone()).with_config(HandlerConfig {
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval),
            ..Default::default()
        }),
    );

    let tls = match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => {
            let mut config = ServerTlsConfig::new(cert, key);
            if let Some(ca) = &cli.client_ca {
                config = config.with_client_ca(ca);
                debug!("Client certificates verified against {}", ca.display());
            }
            Some(config)
        }
        _ => {
            warn!("No TLS certificate configured - agents connect over plain ws://");
            None
        }
    };

    let listener = TunnelListener::bind(cli.listen, tls.as_ref())
        .await
        .context("Failed to bind tunnel listener")?;
    if tls.is_some() {
        info!(
            mutual_auth = listener.mutual_auth(),
            "Tunnels accepted over wss://"
        );
    }

    let api = ApiServer::new(
        ApiServerConfig {
            bind_addr: cli.api_listen,
            enable_cors: cli.cors,
        },
        TransferService::new(registry.clone(), transfers.clone()),
    );

    let _reconcile = spawn_reconcile_task(
        registry.clone(),
        Duration::from_secs(cli.reconcile_interval),
    );
    if let Some(timeout) = cli.transfer_timeout {
        info!("Idle transfers fail after {}s", timeout);
    }
    let _reaper = spawn_transfer_reaper(transfers, REAPER_PERIOD);

    tokio::select! {
        result = serve_tunnels(listener, handler) => {
            result.context("Tunnel listener stopped")?;
        }
        result = api.start() => {
            result.context("API server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    info!("Coordinator stopped");
    Ok(())
}
