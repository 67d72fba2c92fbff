//! CSMS Node - CLI for the charge-point session gateway
//!
//! # Usage
//!
//! ```bash
//! # Defaults: port 9000, `python OCPP_handler.py` per session, ./csms.db
//! csms-node
//!
//! # Different port and decoder
//! PORT=9100 csms-node --decoder python3 --decoder-arg handlers/OCPP_handler.py
//!
//! # Verbose, with decoder stderr
//! csms-node --log-level debug
//! ```
//!
//! Charge points connect to `ws://<host>:<port>/<id>`, dashboards to
//! `/dashboard` and SCADA adapters to `/scada`.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use csms_gateway::{Gateway, GatewayConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// OCPP 1.6 charge-point session gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket listen port
    #[arg(short, long, env = "PORT", default_value = "9000")]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Decoder program spawned for every charge point session
    #[arg(long, env = "CSMS_DECODER", default_value = "python")]
    decoder: String,

    /// Decoder argument (can be repeated)
    #[arg(long = "decoder-arg", default_values_t = [String::from("OCPP_handler.py")])]
    decoder_args: Vec<String>,

    /// Working directory for the decoder
    #[arg(long)]
    decoder_dir: Option<PathBuf>,

    /// SQLite database URL
    #[arg(long, env = "CSMS_DATABASE_URL", default_value = "sqlite://csms.db")]
    database_url: String,

    /// Supervisory root folder name
    #[arg(long, default_value = "ChargePoints")]
    scada_root: String,

    /// Shutdown grace period in milliseconds
    #[arg(long, default_value = "1000")]
    shutdown_grace_ms: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let listen_addr = SocketAddr::new(args.bind, args.port);

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             CSMS Node - Charge Point Session Gateway         ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:   {:<50} ║", format!("ws://{}", listen_addr));
    println!("║  Decoder:  {:<50} ║", truncate(&decoder_line(&args), 50));
    println!("║  Database: {:<50} ║", truncate(&args.database_url, 50));
    println!("║  SCADA:    {:<50} ║", args.scada_root);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = GatewayConfig::default()
        .with_listen_addr(listen_addr)
        .with_decoder(&args.decoder, args.decoder_args.iter().cloned())
        .with_database_url(&args.database_url)
        .with_root_folder(&args.scada_root)
        .with_shutdown_grace(Duration::from_millis(args.shutdown_grace_ms));

    if let Some(dir) = &args.decoder_dir {
        config = config.with_decoder_dir(dir);
    }

    info!("Starting CSMS gateway...");

    let gateway = match Gateway::start(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.run_until(shutdown_signal()).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

fn decoder_line(args: &Args) -> String {
    std::iter::once(args.decoder.as_str())
        .chain(args.decoder_args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
