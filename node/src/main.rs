// Copyright (c) 2026 Stepswap Labs. MIT License.
// See LICENSE for details.

//! # stepswap Relay Node
//!
//! Entry point for the `stepswap-node` binary. Parses CLI arguments,
//! initializes logging and metrics, and runs the broker-side relay
//! server peers connect to.
//!
//! The binary supports three subcommands:
//!
//! - `relay`   — run the relay server
//! - `init`    — generate an overlay identity keypair
//! - `version` — print build version information

mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

use stepswap_protocol::crypto::TradeKeypair;
use stepswap_protocol::ids::OverlayId;
use stepswap_protocol::relay::RelayServer;

use cli::{Commands, NodeCli};
use logging::LogFormat;
use metrics::RelayMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = NodeCli::parse();

    match cli.command {
        Commands::Relay(args) => run_relay(args).await,
        Commands::Init(args) => init_identity(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Runs the relay server plus the Prometheus metrics endpoint.
async fn run_relay(args: cli::RelayArgs) -> Result<()> {
    logging::init_logging(
        &format!(
            "stepswap_node={level},stepswap_protocol={level}",
            level = args.log_level
        ),
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        bind_addr = %args.bind_addr,
        metrics_addr = %args.metrics_addr,
        "starting stepswap relay node"
    );

    // --- Relay server (bind failure is fatal) ---
    let server = RelayServer::bind(&args.bind_addr)
        .await
        .with_context(|| format!("failed to bind relay server on {}", args.bind_addr))?;
    let mut network_size = server.network_size();

    // --- Metrics ---
    let relay_metrics = Arc::new(RelayMetrics::new());
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&relay_metrics));
    let metrics_listener = tokio::net::TcpListener::bind(&args.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", args.metrics_addr))?;
    tracing::info!("metrics server listening on {}", args.metrics_addr);

    // --- Wire the membership watch into the gauge ---
    let gauge_metrics = Arc::clone(&relay_metrics);
    let gauge_loop = tokio::spawn(async move {
        while network_size.changed().await.is_ok() {
            let size = *network_size.borrow();
            gauge_metrics.network_size.set(i64::from(size));
            gauge_metrics.membership_changes_total.inc();
        }
    });

    // --- Serve ---
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!("relay server error: {}", e);
            }
        }
        result = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = result {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    gauge_loop.abort();
    tracing::info!("stepswap relay node stopped");
    Ok(())
}

/// Generates an overlay identity keypair and writes it into the data
/// directory.
fn init_identity(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("stepswap_node=info", LogFormat::Pretty);

    let data_dir = cli::resolve_data_dir(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = data_dir.join("identity.key");
    if key_path.exists() && !args.force {
        bail!(
            "identity already exists at {} (use --force to overwrite)",
            key_path.display()
        );
    }

    let keypair = TradeKeypair::generate();
    let overlay_id = OverlayId::from_public_key(&keypair.public_key());
    std::fs::write(&key_path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("failed to write identity key to {}", key_path.display()))?;

    // The key is as sensitive as a wallet seed.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(
        overlay_id = %overlay_id.to_hex(),
        key_path = %key_path.display(),
        "identity generated"
    );

    println!("Identity initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Identity key   : {}", key_path.display());
    println!("  Overlay id     : {}", overlay_id.to_hex());

    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("stepswap-node {}", env!("CARGO_PKG_VERSION"));
    println!(
        "wire protocol  {}",
        stepswap_protocol::config::WIRE_PROTOCOL_VERSION
    );
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
