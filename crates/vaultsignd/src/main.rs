//! VaultSign gadget daemon.
//!
//! Wires the stack together on the device: the USB bulk endpoint pair as
//! the transport, the broker on top, and the signer dispatcher over the
//! keychain as the request handler. Runs until SIGINT/SIGTERM, then shuts
//! the broker down and wipes every unlocked key.

mod endpoint;

use anyhow::Context;
use clap::Parser;
use endpoint::EndpointTransport;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use vaultsign_broker::{Broker, BrokerConfig};
use vaultsign_keychain::{FileStore, KeyRing};
use vaultsign_signer::{Dispatcher, LogRing, LogRingLayer};

/// VaultSign signing peripheral daemon.
#[derive(Parser)]
#[command(name = "vaultsignd")]
#[command(version)]
#[command(about = "VaultSign signing peripheral daemon", long_about = None)]
struct Cli {
    /// Key store directory.
    #[arg(long, default_value = "/var/lib/vaultsign")]
    base_dir: PathBuf,

    /// USB bulk OUT endpoint device (host-to-gadget reads).
    #[arg(long)]
    ep_out: PathBuf,

    /// USB bulk IN endpoint device (gadget-to-host writes).
    #[arg(long)]
    ep_in: PathBuf,

    /// Logging filter (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Reassembly stash capacity in bytes.
    #[arg(long)]
    stash_capacity: Option<usize>,

    /// Lines kept for the host's Logs request.
    #[arg(long, default_value = "512")]
    log_ring_lines: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_ring = LogRing::new(cli.log_ring_lines);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(LogRingLayer::new(log_ring.clone()))
        .init();

    info!(base_dir = %cli.base_dir.display(), "starting vaultsignd");

    let store = Arc::new(
        FileStore::new(&cli.base_dir)
            .with_context(|| format!("opening key store at {}", cli.base_dir.display()))?,
    );
    let keyring = Arc::new(KeyRing::new(store));
    let dispatcher = Dispatcher::new(keyring.clone(), log_ring);

    let transport = Arc::new(
        EndpointTransport::open(&cli.ep_out, &cli.ep_in)
            .await
            .context("opening USB endpoint pair")?,
    );

    let mut config = BrokerConfig::default();
    if let Some(capacity) = cli.stash_capacity {
        config.stash_capacity = capacity;
    }
    let broker = Broker::spawn(transport, dispatcher, config);
    info!("broker running");

    wait_for_shutdown().await;

    info!("shutting down");
    broker.shutdown().await;
    keyring.lock_all().await;
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::error!(%err, "installing SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
