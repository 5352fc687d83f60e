#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # vncgate
//!
//! A gateway that lets browser-based VNC clients reach TCP-only VNC servers
//! by bridging WebSocket connections to raw TCP, with an access-control
//! policy over which destinations may be dialed.
//!
//! ## Subcommands
//!
//! - `vncgate serve` (default) — run the HTTP/WebSocket gateway
//! - `vncgate tunnel <proxy> [target_host [target_port]]` — the reverse
//!   tunnel: listen on a local TCP port and bridge each connection to a
//!   gateway over WebSocket, so a desktop viewer can reach a host behind it
//!
//! ## HTTP surface
//!
//! | Method | Path                 | Description                              |
//! |--------|----------------------|------------------------------------------|
//! | GET    | `/`                  | Landing page                             |
//! | GET    | `/api/health`        | Liveness probe                           |
//! | GET    | `/vnc`               | Tunnel to the default destination        |
//! | GET    | `/vnc/{host}`        | Tunnel to an explicit host               |
//! | GET    | `/vnc/{host}/{port}` | Tunnel to an explicit host and port      |
//! | *      | anything else        | Browser client files (`novnc_dir`) / 404 |
//!
//! `/vnc` upgrades to a WebSocket carrying binary frames that transparently
//! proxy the destination's TCP byte stream. Policy denials answer `401`
//! with the reason as the body; authorized responses name the resolved
//! destination in `X-Target-Addr`.
//!
//! ## Architecture
//!
//! ```text
//! main.rs     — entry point, clap subcommands, router setup, shutdown
//! config.rs   — TOML + env-var configuration
//! policy.rs   — destination access control (options, toggles, CIDR)
//! sniff.rs    — magic-prefix check on freshly dialed destinations
//! relay.rs    — bidirectional copy engine, synchronized teardown
//! bridge.rs   — per-session WebSocket↔TCP bridge
//! routes/
//!   index.rs  — GET /
//!   health.rs — GET /api/health
//!   vnc.rs    — GET /vnc[/{host}[/{port}]]
//! tunnel.rs   — reverse tunnel client (detect, health-check, serve)
//! ```

use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use vncgate::config::Config;
use vncgate::policy::AddressPolicy;
use vncgate::state::AppState;
use vncgate::tunnel::{self, TunnelOptions};
use vncgate::routes;

/// WebSocket to TCP gateway for browser VNC clients.
#[derive(Parser)]
#[command(name = "vncgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Bridge a local TCP listener to a gateway over WebSocket.
    Tunnel {
        /// The gateway in [http[s]://]hostname[:port] form. The scheme is
        /// autodetected when omitted.
        proxy: String,
        /// Target host to request (requires arbitrary hosts on the gateway).
        target_host: Option<String>,
        /// Target port to request (requires arbitrary ports on the gateway).
        target_port: Option<String>,
        /// Address to listen for viewer connections on.
        #[arg(short, long, default_value = ":5900")]
        listen: String,
        /// Interval (seconds) to retry the initial connection on failure;
        /// negative = fail fast.
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        retry: i64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Tunnel {
            proxy,
            target_host,
            target_port,
            listen,
            retry,
        }) => {
            run_tunnel(TunnelOptions {
                proxy,
                target_host,
                target_port,
                listen,
                retry,
            })
            .await;
        }
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

fn init_tracing(default_level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_tunnel(opts: TunnelOptions) {
    init_tracing("info");
    if let Err(e) = tunnel::run(opts).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config.logging.level);

    info!("vncgate v{} starting", env!("CARGO_PKG_VERSION"));

    let policy = match AddressPolicy::from_config(&config.policy) {
        Ok(policy) => policy,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };

    // The default host is dialed whenever a request omits the host segment;
    // tell the operator at boot if the CIDR policy would refuse it.
    if let Some(filter) = policy.cidr() {
        if let Err(reason) = filter.check_host(policy.default_host()).await {
            warn!("default host does not pass cidr blacklist/whitelist: {reason}");
        }
    }

    let listen = config.server.listen.clone();
    info!("listening on http://{listen}");
    if !policy.arbitrary_hosts()
        && !policy.arbitrary_ports()
        && policy.host_options().is_empty()
        && policy.default_host() == "localhost"
        && policy.default_port() == 5900
        && !config.server.basic_ui
    {
        info!("run with --help for more options");
    }

    let state = AppState {
        policy: Arc::new(policy),
        config: Arc::new(config),
        start_time: Instant::now(),
    };
    let app = routes::router(state);

    let listener = TcpListener::bind(&listen).await.expect("Failed to bind");

    // Graceful shutdown: stop accepting on SIGINT/SIGTERM. In-flight
    // sessions are abandoned at process exit.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("goodbye");
}
