//! podnet node daemon entry point.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod api;
mod bridge;
mod client;
mod config;
mod directory;
mod error;
mod ipam;
mod netctl;
mod overlay;
mod registry;
mod runtime;
mod store;
mod sync;
mod types;

use bridge::BridgeController;
use client::PeerClient;
use config::{Config, SyncRole};
use directory::Directory;
use ipam::Ipam;
use netctl::NetCtl;
use overlay::{OverlayController, VxlanDevice};
use registry::Registry;
use runtime::HostRunner;
use store::{read_topology, TopologyStore};
use types::NetworkMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting podnetd with config: {:?}", cfg);

    let client = PeerClient::new(cfg.listen_port, cfg.request_timeout())?;

    // Initial topology: from disk, or from the master for a follower
    let topology = match (&cfg.sync, &cfg.master_addr) {
        (SyncRole::Follower, Some(master)) => client
            .topology(master)
            .await
            .with_context(|| format!("Failed to fetch topology from {}", master))?,
        _ => read_topology(&cfg.topology_path)
            .await
            .with_context(|| format!("Failed to load {}", cfg.topology_path.display()))?,
    };
    let mode = topology.network;
    let store = Arc::new(TopologyStore::new(topology));
    let node = store
        .snapshot()
        .node(&cfg.node_name)
        .cloned()
        .with_context(|| format!("Node {} is not in the topology", cfg.node_name))?;
    info!(
        "Node {} ({}) owns {} in {:?} mode",
        node.name, node.ip, node.cidr, mode
    );

    // Shared components
    let net = NetCtl::new(Arc::new(HostRunner));
    let registry = Arc::new(Registry::new(cfg.netns_dir.clone()));
    registry
        .discover()
        .await
        .context("Failed to list network namespaces")?;
    let ipam = Arc::new(Ipam::new(registry.clone()));
    let directory = Arc::new(Directory::new(
        cfg.node_name.clone(),
        store.clone(),
        registry.clone(),
    ));

    let listener = TcpListener::bind((node.ip, cfg.listen_port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", node.ip, cfg.listen_port))?;

    // Bridge Controller
    let bridge = Arc::new(BridgeController::new(
        node.clone(),
        cfg.bridge_name.clone(),
        cfg.veth_prefix.clone(),
        net.clone(),
        registry.clone(),
        ipam,
    ));
    bridge.init().await.context("Bridge setup failed")?;
    store.register(bridge.clone()).await;

    // Overlay Controller
    let overlay = if mode == NetworkMode::Overlay {
        let master = match cfg.sync {
            SyncRole::Follower => cfg.master_addr.clone(),
            _ => None,
        };
        let device = VxlanDevice {
            name: cfg.vxlan_name.clone(),
            vni: cfg.vxlan_id,
            port: cfg.vxlan_port,
        };
        let overlay = Arc::new(OverlayController::new(
            device,
            net.clone(),
            client.clone(),
            directory.clone(),
            master,
        )?);
        overlay.init().await.context("Overlay setup failed")?;
        store.register(overlay.clone()).await;
        Some(overlay)
    } else {
        None
    };

    store.notify_all().await;

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    // HTTP API
    let app = api::router(directory, cfg.sync == SyncRole::Master);
    let api_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = api::serve(listener, app, api_cancel).await {
            error!("API server failed: {}", e);
        }
    }));

    handles.push(tokio::spawn(registry.run(cfg.tick(), cancel.clone())));
    handles.push(tokio::spawn(bridge.run(
        cfg.tick(),
        cancel.clone(),
        cfg.cleanup,
    )));
    if let Some(overlay) = overlay {
        handles.push(tokio::spawn(overlay.run(
            cfg.tick(),
            cancel.clone(),
            cfg.cleanup,
        )));
    }

    // Cluster Sync
    match (&cfg.sync, &cfg.master_addr) {
        (SyncRole::Master, _) => {
            handles.push(tokio::spawn(sync::run_master(
                store.clone(),
                cfg.topology_path.clone(),
                cfg.sync_interval(),
                cancel.clone(),
            )));
        }
        (SyncRole::Follower, Some(master)) => {
            handles.push(tokio::spawn(sync::run_follower(
                store.clone(),
                client,
                master.clone(),
                cfg.sync_interval(),
                cancel.clone(),
            )));
        }
        _ => {}
    }

    // Graceful Shutdown
    shutdown_signal().await;
    cancel.cancel();
    for result in futures_util::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Task failed during shutdown: {}", e);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Unable to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
