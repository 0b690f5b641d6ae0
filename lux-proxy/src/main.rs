//! lux-proxy entry point.
//!
//! ```text
//! lux-proxy --mode client                 SOCKS5 listener end
//! lux-proxy --mode server                 target-dialling end
//! lux-proxy --mode client --listen ...    override the SOCKS5 address
//! lux-proxy --mode server --capture-x 80 --capture-y 120
//! ```
//!
//! Settings not given on the command line come from the per-role JSON
//! config; overrides are written back so they stick.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lux_core::{run_client, run_server, PeerConfig, Role};
use lux_proxy::config::ProxyConfig;
use lux_proxy::platform::{StubCamera, StubGrabber};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "lux-proxy", about = "SOCKS5 tunnel over a video channel")]
struct Cli {
    /// Peer role: "client" or "server".
    #[arg(short, long)]
    mode: String,

    /// SOCKS5 listen address (client role).
    #[arg(short, long)]
    listen: Option<String>,

    /// X coordinate of the capture region.
    #[arg(long)]
    capture_x: Option<i32>,

    /// Y coordinate of the capture region.
    #[arg(long)]
    capture_y: Option<i32>,

    /// Margin between the frame edge and the data grid.
    #[arg(long)]
    margin: Option<usize>,

    /// Path to the JSON config (defaults to config_<mode>.json).
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let role: Role = match cli.mode.parse() {
        Ok(role) => role,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };
    let mode = role.to_string();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| ProxyConfig::path_for(&mode));
    let mut config = ProxyConfig::load(&config_path);

    // Flags override the file; persist the merged result.
    let before = format!("{config:?}");
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(x) = cli.capture_x {
        config.capture_x = x;
    }
    if let Some(y) = cli.capture_y {
        config.capture_y = y;
    }
    if let Some(margin) = cli.margin {
        config.margin = margin;
    }
    if format!("{config:?}") != before {
        if let Err(e) = config.save(&config_path) {
            tracing::warn!(error = %e, "could not persist config");
        }
    }

    info!(
        mode = %role,
        capture_x = config.capture_x,
        capture_y = config.capture_y,
        margin = config.margin,
        "starting"
    );

    let peer_cfg = PeerConfig {
        margin: config.margin,
        capture_x: config.capture_x,
        capture_y: config.capture_y,
        listen: config.listen.clone(),
        hb_interval: Duration::from_secs(config.heartbeat_interval.max(1)),
    };

    let shutdown = CancellationToken::new();
    let ctrlc = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received; shutting down");
        ctrlc.cancel();
    });

    let grabber = Arc::new(StubGrabber);
    let camera = Arc::new(StubCamera);

    let result = match role {
        Role::Client => run_client(peer_cfg, grabber, camera, shutdown).await,
        Role::Server => run_server(peer_cfg, grabber, camera, shutdown).await,
    };

    if let Err(e) = result {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
