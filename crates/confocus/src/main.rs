//! Conference focus entry point
//!
//! Wires the root objects together: configuration, logging, the signaling
//! adapter and its connection driver, the bridge catalog and detectors,
//! and the focus manager. Exits 0 on a clean shutdown, 1 on startup
//! failure.

mod config;
mod connection;

use clap::Parser;
use config::FocusConfig;
use confocus_bridge_core::{BridgeCatalog, BridgeDetector, BridgeSelector, WorkerDetector};
use confocus_conference_core::{ConferenceServices, FocusManager};
use confocus_xmpp_core::{Jid, RoomJid, XmppAdapter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "confocus", about = "Conference focus")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, short)]
    config: PathBuf,
}

fn init_logging(config: &config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match FocusConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("startup failed: {}", err);
            std::process::exit(1);
        }
    };
    init_logging(&config.logging);

    if let Err(err) = run(config).await {
        error!("startup failed: {}", err);
        std::process::exit(1);
    }
}

async fn run(config: FocusConfig) -> anyhow::Result<()> {
    let focus_jid = Jid::parse(&config.xmpp.focus_jid)
        .map_err(|e| anyhow::anyhow!("bad focus_jid: {}", e))?;
    let brewery_room = RoomJid::parse(&config.xmpp.brewery_room)
        .map_err(|e| anyhow::anyhow!("bad brewery_room: {}", e))?;

    // Signaling fabric and its connection driver.
    let (transport, outbound) = connection::StreamTransport::new();
    let adapter = XmppAdapter::new(focus_jid, Arc::new(transport));
    tokio::spawn(connection::drive(
        adapter.clone(),
        config.xmpp.server_addr.clone(),
        outbound,
    ));

    // Bridge discovery and selection.
    let catalog = Arc::new(BridgeCatalog::new());
    let selector = Arc::new(BridgeSelector::new(catalog.clone()));
    let bridge_detector = BridgeDetector::new(
        adapter.clone(),
        catalog.clone(),
        brewery_room,
        config.xmpp.focus_nick.clone(),
    );
    bridge_detector.start()?;

    let mut worker_detectors = Vec::new();
    for room in &config.xmpp.worker_rooms {
        match RoomJid::parse(room) {
            Ok(room) => {
                let detector =
                    WorkerDetector::new(adapter.clone(), room, config.xmpp.focus_nick.clone());
                detector.start()?;
                worker_detectors.push(detector);
            }
            Err(err) => warn!("skipping bad worker room {}: {}", room, err),
        }
    }

    // The conference core.
    let services = ConferenceServices {
        adapter,
        selector,
        catalog,
        config: Arc::new(config.conference.clone()),
        focus_nick: config.xmpp.focus_nick.clone(),
    };
    let focus = FocusManager::new(services);
    focus.start().await?;

    info!("confocus {} up", env!("CARGO_PKG_VERSION"));

    wait_for_shutdown().await;
    info!("termination signal received; draining");
    let grace = Duration::from_secs(config.shutdown.grace_seconds);
    if tokio::time::timeout(grace, focus.shutdown("focus shutting down"))
        .await
        .is_err()
    {
        warn!("drain did not finish within {:?}", grace);
    }
    bridge_detector.stop();
    for detector in &worker_detectors {
        detector.stop();
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
