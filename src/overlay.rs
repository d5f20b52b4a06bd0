//! VXLAN overlay between nodes.
//!
//! The device is created with learning disabled: every remote container
//! gets an explicit neighbor entry pointing at its node's overlay MAC, and
//! every remote node gets a forwarding entry sending that MAC to its
//! underlay address.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::client::PeerClient;
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::netctl::{NetCtl, EXISTS, GONE};
use crate::store::TopologyConsumer;
use crate::types::{parse_mac, Node, Topology};

static LINK_ETHER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"link/ether\s([0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5})").expect("valid regex")
});

/// Extracts the hardware address from `ip link`/`ip addr` output.
pub fn parse_link_mac(output: &str) -> Option<String> {
    LINK_ETHER
        .captures(output)
        .map(|caps| caps[1].to_ascii_lowercase())
}

/// VXLAN device parameters.
#[derive(Debug, Clone)]
pub struct VxlanDevice {
    pub name: String,
    pub vni: u32,
    pub port: u16,
}

pub struct OverlayController {
    device: VxlanDevice,
    node: Node,
    peers: ArcSwap<Vec<Node>>,
    net: NetCtl,
    client: PeerClient,
    directory: Arc<Directory>,
    /// Master to report our MAC to; `None` when the store is local.
    master: Option<String>,
    /// Whether the current MAC has reached the topology store.
    published: AtomicBool,
}

impl OverlayController {
    pub fn new(
        device: VxlanDevice,
        net: NetCtl,
        client: PeerClient,
        directory: Arc<Directory>,
        master: Option<String>,
    ) -> Result<Self> {
        let node = directory.current_node()?;
        let peers = directory
            .store()
            .snapshot()
            .peers(&node.name)
            .cloned()
            .collect();
        Ok(Self {
            device,
            node,
            peers: ArcSwap::from_pointee(peers),
            net,
            client,
            directory,
            master,
            published: AtomicBool::new(false),
        })
    }

    /// Brings the VXLAN device up and publishes its MAC.
    pub async fn init(&self) -> Result<()> {
        let dev = self.device.name.as_str();
        self.net
            .create_vxlan(
                dev,
                self.device.vni,
                self.node.ip,
                &self.node.interface,
                self.device.port,
            )
            .await?
            .tolerate(EXISTS)?;
        self.net
            .assign_address(None, dev, &self.node.vxlan.ip.to_string())
            .await?
            .tolerate(EXISTS)?;
        self.net.set_link_up(None, dev).await?.ok()?;

        let output = self.net.show_interface(None, dev).await?.ok()?;
        let mac = parse_link_mac(&output).ok_or_else(|| Error::MacNotFound {
            device: dev.to_string(),
            output: output.trim().to_string(),
        })?;
        info!("VXLAN device {} is up with MAC {}", dev, mac);
        self.directory.set_vxlan_mac(mac.clone()).await;
        self.publish_mac(&mac).await;
        Ok(())
    }

    async fn publish_mac(&self, mac: &str) {
        let result = match &self.master {
            Some(master) => {
                self.client
                    .publish_vxlan_mac(master, &self.node.name, mac)
                    .await
            }
            None => self.directory.store().set_vxlan_mac(&self.node.name, mac).await,
        };
        match result {
            Ok(()) => self.published.store(true, Ordering::Release),
            Err(e) => warn!("Failed to publish overlay MAC {}: {}", mac, e),
        }
    }

    /// Programs routes, neighbors and forwarding entries for one peer.
    async fn sync_peer(&self, peer: &Node) -> Result<()> {
        let dev = self.device.name.as_str();
        if let Err(e) = self
            .net
            .add_route(peer.cidr, dev)
            .await
            .and_then(|inv| inv.tolerate(EXISTS))
        {
            error!("Failed to route {} via {}: {}", peer.cidr, dev, e);
        }

        let containers = self.client.containers(peer.ip).await?;
        let mac = self.client.vxlan_mac(peer.ip).await?;
        parse_mac(&mac)?;

        let mut reachable = 0;
        for container in &containers {
            let Some(ip) = container.ip else {
                continue;
            };
            reachable += 1;
            if let Err(e) = self
                .net
                .replace_neighbor(ip, &mac, dev)
                .await
                .and_then(|inv| inv.ok())
            {
                error!(
                    "Failed to set neighbor {} -> {} for {} on {}: {}",
                    ip, mac, container.name, peer.name, e
                );
            }
        }
        if reachable > 0 {
            self.net
                .append_fdb(&mac, dev, peer.ip)
                .await?
                .tolerate(EXISTS)?;
        }
        debug!(
            "Peer {} ({}): {} reachable containers via {}",
            peer.name, peer.ip, reachable, mac
        );
        Ok(())
    }

    pub async fn reconcile(&self) {
        if !self.published.load(Ordering::Acquire) {
            if let Some(mac) = self.directory.vxlan_mac().await {
                self.publish_mac(&mac).await;
            }
        }
        let peers = self.peers.load_full();
        for peer in peers.iter() {
            if let Err(e) = self.sync_peer(peer).await {
                warn!("Skipping peer {} ({}) this tick: {}", peer.name, peer.ip, e);
            }
        }
    }

    pub async fn cleanup(&self) {
        let result = self.net.delete_link(&self.device.name).await;
        match result.and_then(|inv| inv.tolerate(GONE)) {
            Ok(_) => info!("VXLAN device {} removed", self.device.name),
            Err(e) => warn!("Failed to delete {}: {}", self.device.name, e),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
        cleanup: bool,
    ) {
        info!("Overlay controller running every {:?}", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => self.reconcile().await,
            }
        }
        if cleanup {
            self.cleanup().await;
        }
        info!("Overlay controller stopped");
    }
}

#[async_trait]
impl TopologyConsumer for OverlayController {
    async fn update(&self, topology: Arc<Topology>) {
        let peers: Vec<Node> = topology.peers(&self.node.name).cloned().collect();
        if **self.peers.load() != peers {
            info!("Overlay now spans {} peers", peers.len());
            self.peers.store(Arc::new(peers));
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::api::{self, tests::spawn_api};
    use crate::registry::Registry;
    use crate::runtime::fake::FakeRunner;
    use crate::runtime::CommandOutput;
    use crate::store::{parse_topology, TopologyStore};
    use crate::types::Container;

    const IP_LINK_SHOW: &str = "6: vxlan100: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue state UNKNOWN group default qlen 1000
    link/ether F6:35:84:38:60:F1 brd ff:ff:ff:ff:ff:ff
    inet 10.0.1.0/32 scope global vxlan100
";

    /// Two nodes on localhost: A is under test, B is served by a real API.
    fn topology() -> &'static str {
        r#"
network: overlay
nodes:
  - name: node-a
    interface: lo
    ip: 127.0.0.1
    cidr: 10.0.1.0/24
    gateway: 10.0.1.1
    vxlan:
      ip: 10.0.1.0/32
  - name: node-b
    interface: lo
    ip: 127.0.0.1
    cidr: 10.0.2.0/24
    gateway: 10.0.2.1
    vxlan:
      ip: 10.0.2.0/32
"#
    }

    fn device() -> VxlanDevice {
        VxlanDevice {
            name: "vxlan100".into(),
            vni: 100,
            port: 4789,
        }
    }

    struct Peer {
        _dir: tempfile::TempDir,
        directory: Arc<Directory>,
        registry: Arc<Registry>,
        port: u16,
        cancel: CancellationToken,
    }

    async fn peer_b(store: Arc<TopologyStore>, containers: &[&str]) -> Peer {
        let dir = tempfile::tempdir().unwrap();
        for name in containers {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let registry = Arc::new(Registry::new(dir.path()));
        registry.discover().await.unwrap();
        let directory = Arc::new(Directory::new("node-b".into(), store, registry.clone()));
        let (port, cancel) = spawn_api(directory.clone(), false).await;
        Peer {
            _dir: dir,
            directory,
            registry,
            port,
            cancel,
        }
    }

    fn controller(
        store: Arc<TopologyStore>,
        runner: Arc<FakeRunner>,
        port: u16,
    ) -> (tempfile::TempDir, OverlayController) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(dir.path()));
        let directory = Arc::new(Directory::new("node-a".into(), store, registry));
        let client = PeerClient::new(port, Duration::from_secs(2)).unwrap();
        let overlay =
            OverlayController::new(device(), NetCtl::new(runner), client, directory, None)
                .unwrap();
        (dir, overlay)
    }

    #[test]
    fn test_parse_link_mac() {
        assert_eq!(
            parse_link_mac(IP_LINK_SHOW).as_deref(),
            Some("f6:35:84:38:60:f1")
        );
        assert_eq!(parse_link_mac("link/none"), None);
    }

    #[tokio::test]
    async fn test_init_publishes_mac() {
        let store = Arc::new(TopologyStore::new(parse_topology(topology()).unwrap()));
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            "type vxlan",
            CommandOutput::failed("RTNETLINK answers: File exists"),
        );
        runner.respond("addr show vxlan100", CommandOutput::ok(IP_LINK_SHOW));
        let (_dir, overlay) = controller(store.clone(), runner.clone(), 1);

        overlay.init().await.unwrap();

        assert_eq!(
            runner.calls()[0],
            "ip link add vxlan100 type vxlan id 100 local 127.0.0.1 dev lo dstport 4789 nolearning"
        );
        assert_eq!(
            overlay.directory.vxlan_mac().await.as_deref(),
            Some("f6:35:84:38:60:f1")
        );
        assert_eq!(
            store.snapshot().node("node-a").unwrap().vxlan.mac,
            "f6:35:84:38:60:f1"
        );
    }

    #[tokio::test]
    async fn test_init_fails_without_mac() {
        let store = Arc::new(TopologyStore::new(parse_topology(topology()).unwrap()));
        let runner = Arc::new(FakeRunner::new());
        let (_dir, overlay) = controller(store, runner, 1);
        assert!(matches!(
            overlay.init().await,
            Err(Error::MacNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_tick_programs_peer_containers() {
        let store = Arc::new(TopologyStore::new(parse_topology(topology()).unwrap()));
        let b = peer_b(store.clone(), &["c2", "c3"]).await;
        let mut c2 = Container::new("c2");
        c2.ip = Some("10.0.2.5".parse().unwrap());
        b.registry.set(c2).await;
        b.directory.set_vxlan_mac("aa:bb:cc:dd:ee:ff".into()).await;

        let runner = Arc::new(FakeRunner::new());
        let (_dir, overlay) = controller(store, runner.clone(), b.port);
        overlay.reconcile().await;

        assert_eq!(
            runner.calls(),
            vec![
                "ip route add 10.0.2.0/24 dev vxlan100",
                "ip neighbor replace 10.0.2.5 lladdr aa:bb:cc:dd:ee:ff dev vxlan100",
                "bridge fdb append aa:bb:cc:dd:ee:ff dev vxlan100 dst 127.0.0.1",
            ]
        );
        b.cancel.cancel();
    }

    #[tokio::test]
    async fn test_repeated_ticks_tolerate_existing_entries() {
        let store = Arc::new(TopologyStore::new(parse_topology(topology()).unwrap()));
        let b = peer_b(store.clone(), &["c2"]).await;
        let mut c2 = Container::new("c2");
        c2.ip = Some("10.0.2.5".parse().unwrap());
        b.registry.set(c2).await;
        b.directory.set_vxlan_mac("aa:bb:cc:dd:ee:ff".into()).await;

        let runner = Arc::new(FakeRunner::new());
        let (_dir, overlay) = controller(store, runner.clone(), b.port);
        overlay.reconcile().await;

        runner.respond("ip route", CommandOutput::failed("RTNETLINK answers: File exists"));
        runner.respond("bridge fdb", CommandOutput::failed("RTNETLINK answers: File exists"));
        runner.reset_calls();
        overlay.reconcile().await;
        assert_eq!(runner.calls().len(), 3);
        b.cancel.cancel();
    }

    #[tokio::test]
    async fn test_neighbor_follows_peer_mac_change() {
        let store = Arc::new(TopologyStore::new(parse_topology(topology()).unwrap()));
        let b = peer_b(store.clone(), &["c2"]).await;
        let mut c2 = Container::new("c2");
        c2.ip = Some("10.0.2.5".parse().unwrap());
        b.registry.set(c2).await;
        b.directory.set_vxlan_mac("aa:bb:cc:dd:ee:ff".into()).await;

        let runner = Arc::new(FakeRunner::new());
        let (_dir, overlay) = controller(store, runner.clone(), b.port);
        overlay.reconcile().await;

        // B recreated its VXLAN device.
        b.directory.set_vxlan_mac("11:22:33:44:55:66".into()).await;
        runner.reset_calls();
        overlay.reconcile().await;

        assert_eq!(
            runner.calls_matching("neighbor"),
            vec!["ip neighbor replace 10.0.2.5 lladdr 11:22:33:44:55:66 dev vxlan100"]
        );
        assert_eq!(
            runner.calls_matching("fdb"),
            vec!["bridge fdb append 11:22:33:44:55:66 dev vxlan100 dst 127.0.0.1"]
        );
        b.cancel.cancel();
    }

    #[tokio::test]
    async fn test_mac_report_is_retried_until_master_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let master_addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TopologyStore::new(parse_topology(topology()).unwrap()));
        let registry = Arc::new(Registry::new(dir.path()));
        let directory = Arc::new(Directory::new("node-a".into(), store, registry.clone()));
        let runner = Arc::new(FakeRunner::new());
        runner.respond("addr show vxlan100", CommandOutput::ok(IP_LINK_SHOW));
        let client = PeerClient::new(master_addr.port(), Duration::from_secs(2)).unwrap();
        let overlay = OverlayController::new(
            device(),
            NetCtl::new(runner),
            client,
            directory,
            Some(master_addr.to_string()),
        )
        .unwrap();

        // The master is down while the device comes up.
        overlay.init().await.unwrap();
        assert!(!overlay.published.load(Ordering::Acquire));

        let master_store = Arc::new(TopologyStore::new(parse_topology(topology()).unwrap()));
        let master_dir = Arc::new(Directory::new("node-b".into(), master_store.clone(), registry));
        let listener = TcpListener::bind(master_addr).await.unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(api::serve(
            listener,
            api::router(master_dir, true),
            cancel.clone(),
        ));

        overlay.reconcile().await;
        assert!(overlay.published.load(Ordering::Acquire));
        assert_eq!(
            master_store.snapshot().node("node-a").unwrap().vxlan.mac,
            "f6:35:84:38:60:f1"
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_peer_without_mac_is_skipped() {
        let store = Arc::new(TopologyStore::new(parse_topology(topology()).unwrap()));
        let b = peer_b(store.clone(), &["c2"]).await;
        let mut c2 = Container::new("c2");
        c2.ip = Some("10.0.2.5".parse().unwrap());
        b.registry.set(c2).await;

        let runner = Arc::new(FakeRunner::new());
        let (_dir, overlay) = controller(store, runner.clone(), b.port);
        overlay.reconcile().await;

        // The route is still ensured; nothing else is programmed.
        assert_eq!(runner.calls(), vec!["ip route add 10.0.2.0/24 dev vxlan100"]);
        b.cancel.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_peer_does_not_block_others() {
        let yaml = r#"
nodes:
  - name: node-a
    interface: lo
    ip: 127.0.0.1
    cidr: 10.0.1.0/24
    gateway: 10.0.1.1
    vxlan:
      ip: 10.0.1.0/32
  - name: node-dead
    interface: lo
    ip: 127.0.0.2
    cidr: 10.0.3.0/24
    gateway: 10.0.3.1
    vxlan:
      ip: 10.0.3.0/32
  - name: node-b
    interface: lo
    ip: 127.0.0.1
    cidr: 10.0.2.0/24
    gateway: 10.0.2.1
    vxlan:
      ip: 10.0.2.0/32
"#;
        let store = Arc::new(TopologyStore::new(parse_topology(yaml).unwrap()));
        let b = peer_b(store.clone(), &["c2"]).await;
        let mut c2 = Container::new("c2");
        c2.ip = Some("10.0.2.5".parse().unwrap());
        b.registry.set(c2).await;
        b.directory.set_vxlan_mac("aa:bb:cc:dd:ee:ff".into()).await;

        let runner = Arc::new(FakeRunner::new());
        let (_dir, overlay) = controller(store, runner.clone(), b.port);
        overlay.reconcile().await;

        assert_eq!(runner.calls_matching("neighbor replace 10.0.2.5").len(), 1);
        assert_eq!(runner.calls_matching("dst 127.0.0.1").len(), 1);
        assert!(runner.calls_matching("dst 127.0.0.2").is_empty());
        b.cancel.cancel();
    }

    #[tokio::test]
    async fn test_update_replaces_peers() {
        let store = Arc::new(TopologyStore::new(parse_topology(topology()).unwrap()));
        let runner = Arc::new(FakeRunner::new());
        let (_dir, overlay) = controller(store, runner, 1);
        assert_eq!(overlay.peers.load().len(), 1);

        let mut next = parse_topology(topology()).unwrap();
        next.nodes.retain(|n| n.name == "node-a");
        overlay.update(Arc::new(next)).await;
        assert!(overlay.peers.load().is_empty());
    }
}
