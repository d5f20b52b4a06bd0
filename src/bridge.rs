//! Local bridge and container attachment.
//!
//! Each container moves through two stages, one per reconciliation tick:
//! a veth pair is created and its inner end moved into the namespace, then
//! an address is allocated and the namespace is plumbed onto the bridge.
//! A container whose attachment fails keeps its veth pair and retries the
//! second stage on the next tick.

use std::net::Ipv4Addr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use log::{error, info, warn};
use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::ipam::Ipam;
use crate::netctl::{NetCtl, EXISTS, GONE, MAX_IFNAME_LEN};
use crate::registry::Registry;
use crate::store::TopologyConsumer;
use crate::types::{Container, Node, Topology};

static INET_ADDR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"inet (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})/").expect("valid regex")
});

const NAT_CHAIN: &str = "POSTROUTING";

pub struct BridgeController {
    node: ArcSwap<Node>,
    bridge: String,
    veth_prefix: String,
    net: NetCtl,
    registry: Arc<Registry>,
    ipam: Arc<Ipam>,
    /// Host-side veths created during this run.
    created: Mutex<Vec<String>>,
}

impl BridgeController {
    pub fn new(
        node: Node,
        bridge: String,
        veth_prefix: String,
        net: NetCtl,
        registry: Arc<Registry>,
        ipam: Arc<Ipam>,
    ) -> Self {
        Self {
            node: ArcSwap::from_pointee(node),
            bridge,
            veth_prefix,
            net,
            registry,
            ipam,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Namespace-side and host-side veth names for `container`.
    pub fn veth_names(&self, container: &str) -> Result<(String, String)> {
        let veth0 = format!("{}0{}", self.veth_prefix, container);
        let veth1 = format!("{}1{}", self.veth_prefix, container);
        if veth0.len() > MAX_IFNAME_LEN {
            return Err(Error::InterfaceNameTooLong(veth0));
        }
        Ok((veth0, veth1))
    }

    fn masquerade_rule(&self, node: &Node) -> Vec<String> {
        vec![
            "-s".into(),
            node.cidr.to_string(),
            "!".into(),
            "-o".into(),
            self.bridge.clone(),
            "-j".into(),
            "MASQUERADE".into(),
        ]
    }

    /// One-time node setup, run before the reconciliation loop.
    pub async fn init(&self) -> Result<()> {
        let node = self.node.load_full();
        let gateway = format!("{}/{}", node.gateway, node.cidr.prefix_len());

        self.net.create_bridge(&self.bridge).await?.tolerate(EXISTS)?;
        self.net
            .assign_address(None, &self.bridge, &gateway)
            .await?
            .tolerate(EXISTS)?;
        self.net.set_link_up(None, &self.bridge).await?.ok()?;
        self.net.set_forwarding().await?.ok()?;
        if self.ensure_masquerade().await? {
            info!("Installed masquerade rule for {}", node.cidr);
        }
        info!("Bridge {} is up with {}", self.bridge, gateway);

        self.adopt_existing().await;
        Ok(())
    }

    /// Adds the pod network's masquerade rule unless it is already listed.
    ///
    /// Returns whether a rule was added.
    pub async fn ensure_masquerade(&self) -> Result<bool> {
        let node = self.node.load_full();
        let rule = self.masquerade_rule(&node);
        let rules = self.net.list_nat_rules(NAT_CHAIN).await?.ok()?;
        let canonical = rule.join(" ");
        if rules.lines().any(|line| line.contains(&canonical)) {
            return Ok(false);
        }
        let rule: Vec<&str> = rule.iter().map(String::as_str).collect();
        self.net.add_nat_rule(NAT_CHAIN, &rule).await?.ok()?;
        Ok(true)
    }

    /// Picks up containers plumbed by a previous run of the daemon.
    async fn adopt_existing(&self) {
        let node = self.node.load_full();
        let mut taken = self.registry.assigned_ips().await;
        taken.insert(node.gateway);
        taken.insert(node.vxlan.ip.addr());
        for mut container in self.registry.list().await {
            if container.has_veth() {
                continue;
            }
            let Ok((veth0, veth1)) = self.veth_names(&container.name) else {
                continue;
            };
            let output = match self
                .net
                .show_interface(Some(&container.name), &veth0)
                .await
                .and_then(|inv| inv.ok())
            {
                Ok(output) => output,
                Err(_) => continue,
            };
            let scraped: Option<Ipv4Addr> = INET_ADDR
                .captures(&output)
                .and_then(|caps| caps[1].parse().ok());
            container.ip = match scraped {
                Some(ip) if node.cidr.contains(&ip) && taken.insert(ip) => Some(ip),
                Some(ip) => {
                    warn!(
                        "Not adopting {} for {}: outside {} or already in use",
                        ip, container.name, node.cidr
                    );
                    None
                }
                None => None,
            };
            container.veth0 = Some(veth0);
            container.veth1 = Some(veth1);
            info!(
                "Adopted existing attachment of {} ({:?})",
                container.name, container.ip
            );
            self.registry.set(container).await;
        }
    }

    /// Stage one: create the veth pair and move its inner end.
    async fn create_veth(&self, container: &Container) -> Result<Container> {
        let (veth0, veth1) = self.veth_names(&container.name)?;
        self.net
            .create_veth_pair(&veth0, &veth1)
            .await?
            .tolerate(EXISTS)?;
        {
            let mut created = self.created.lock().await;
            if !created.contains(&veth1) {
                created.push(veth1.clone());
            }
        }
        self.net
            .move_to_namespace(&veth0, &container.name)
            .await?
            .ok()?;

        let mut updated = container.clone();
        updated.veth0 = Some(veth0);
        updated.veth1 = Some(veth1);
        Ok(updated)
    }

    /// Stage two: address the namespace and attach it to the bridge.
    async fn attach(&self, node: &Node, container: &Container) -> Result<Container> {
        let (Some(veth0), Some(veth1)) = (&container.veth0, &container.veth1) else {
            return Ok(container.clone());
        };
        let ns = container.name.as_str();
        let ip = self.ipam.allocate(node, ns).await?;
        let addr = format!("{}/{}", ip, node.cidr.prefix_len());

        self.net
            .assign_address(Some(ns), veth0, &addr)
            .await?
            .tolerate(EXISTS)?;
        self.net.set_link_up(Some(ns), veth0).await?.ok()?;
        self.net.set_link_up(None, veth1).await?.ok()?;
        self.net
            .add_default_route(ns, node.gateway, veth0)
            .await?
            .tolerate(EXISTS)?;
        self.net.attach_to_bridge(veth1, &self.bridge).await?.ok()?;

        let mut updated = container.clone();
        updated.ip = Some(ip);
        Ok(updated)
    }

    /// Advances every incomplete container by one stage.
    pub async fn reconcile(&self) {
        let node = self.node.load_full();
        for name in self.registry.list().await.into_iter().map(|c| c.name) {
            // Earlier stages may have taken a while; skip pruned records.
            let Some(container) = self.registry.get(&name).await else {
                continue;
            };
            if !container.has_veth() {
                match self.create_veth(&container).await {
                    Ok(updated) => {
                        info!(
                            "Created veth pair {:?}/{:?} for {}",
                            updated.veth0, updated.veth1, updated.name
                        );
                        self.registry.set(updated).await;
                    }
                    Err(e) => error!(
                        "Failed to create veth pair for {}: {}",
                        container.name, e
                    ),
                }
            } else if container.ip.is_none() {
                match self.attach(&node, &container).await {
                    Ok(updated) => {
                        info!("Attached {} as {:?}", updated.name, updated.ip);
                        self.registry.set(updated).await;
                    }
                    Err(e) => error!(
                        "Failed to attach {} to {}: {}",
                        container.name, self.bridge, e
                    ),
                }
            }
        }
    }

    /// Removes the bridge and every veth pair created during this run.
    pub async fn cleanup(&self) {
        let steps = [
            ("bring down", self.net.set_link_down(&self.bridge).await),
            ("delete", self.net.delete_bridge(&self.bridge).await),
        ];
        for (what, result) in steps {
            if let Err(e) = result.and_then(|inv| inv.tolerate(GONE)) {
                warn!("Failed to {} bridge {}: {}", what, self.bridge, e);
            }
        }
        for veth in self.created.lock().await.drain(..) {
            let result = self.net.delete_link(&veth).await;
            if let Err(e) = result.and_then(|inv| inv.tolerate(GONE)) {
                warn!("Failed to delete {}: {}", veth, e);
            }
        }
        info!("Bridge {} removed", self.bridge);
    }

    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
        cleanup: bool,
    ) {
        info!("Bridge controller running every {:?}", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => self.reconcile().await,
            }
        }
        if cleanup {
            self.cleanup().await;
        }
        info!("Bridge controller stopped");
    }
}

#[async_trait]
impl TopologyConsumer for BridgeController {
    async fn update(&self, topology: Arc<Topology>) {
        let current = self.node.load_full();
        let Some(node) = topology.node(&current.name) else {
            warn!("Node {} is missing from the new topology", current.name);
            return;
        };
        if node.cidr != current.cidr || node.gateway != current.gateway {
            warn!(
                "Pod network of {} changed to {} via {}; restart to re-address",
                node.name, node.cidr, node.gateway
            );
            return;
        }
        if *current != *node {
            self.node.store(Arc::new(node.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRunner;
    use crate::runtime::CommandOutput;
    use crate::types::{parse_overlay_ip, Vxlan};

    fn node_a() -> Node {
        Node {
            name: "node-a".into(),
            interface: "eth0".into(),
            ip: "192.168.0.1".parse().unwrap(),
            cidr: "10.0.1.0/24".parse().unwrap(),
            gateway: "10.0.1.1".parse().unwrap(),
            vxlan: Vxlan {
                ip: parse_overlay_ip("10.0.1.2").unwrap(),
                mac: String::new(),
            },
            containers: Vec::new(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        runner: Arc<FakeRunner>,
        registry: Arc<Registry>,
        bridge: BridgeController,
    }

    async fn fixture(namespaces: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for name in namespaces {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let registry = Arc::new(Registry::new(dir.path()));
        registry.discover().await.unwrap();
        let ipam = Arc::new(Ipam::new(registry.clone()));
        let runner = Arc::new(FakeRunner::new());
        let bridge = BridgeController::new(
            node_a(),
            "br0".into(),
            "veth".into(),
            NetCtl::new(runner.clone()),
            registry.clone(),
            ipam,
        );
        Fixture {
            _dir: dir,
            runner,
            registry,
            bridge,
        }
    }

    #[tokio::test]
    async fn test_container_is_attached_over_two_ticks() {
        let f = fixture(&["c1"]).await;

        f.bridge.reconcile().await;
        let c1 = f.registry.get("c1").await.unwrap();
        assert_eq!(c1.veth0.as_deref(), Some("veth0c1"));
        assert_eq!(c1.veth1.as_deref(), Some("veth1c1"));
        assert_eq!(c1.ip, None);

        f.bridge.reconcile().await;
        let c1 = f.registry.get("c1").await.unwrap();
        let ip = c1.ip.unwrap();
        let node = node_a();
        assert!(node.cidr.contains(&ip));
        for taken in ["10.0.1.0", "10.0.1.1", "10.0.1.2"] {
            assert_ne!(ip.to_string(), taken);
        }

        assert_eq!(
            f.runner.calls(),
            vec![
                "ip link add veth0c1 type veth peer name veth1c1",
                "ip link set veth0c1 netns c1",
                "ip -n c1 addr add 10.0.1.3/24 dev veth0c1",
                "ip -n c1 link set veth0c1 up",
                "ip link set veth1c1 up",
                "ip -n c1 route add default via 10.0.1.1 dev veth0c1",
                "ip link set veth1c1 master br0",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_attach_never_recreates_veth() {
        let f = fixture(&["c1"]).await;
        f.runner.respond(
            "addr add",
            CommandOutput::failed("RTNETLINK answers: Permission denied"),
        );

        for _ in 0..3 {
            f.bridge.reconcile().await;
        }
        assert_eq!(f.runner.calls_matching("type veth").len(), 1);
        assert_eq!(f.runner.calls_matching("addr add").len(), 2);
        assert_eq!(f.registry.get("c1").await.unwrap().ip, None);

        // Once the failure clears, the retry reuses the reserved address.
        f.runner.clear_rules();
        f.bridge.reconcile().await;
        let c1 = f.registry.get("c1").await.unwrap();
        assert_eq!(c1.ip, Some("10.0.1.3".parse().unwrap()));
        assert_eq!(f.runner.calls_matching("type veth").len(), 1);
    }

    #[tokio::test]
    async fn test_existing_objects_are_not_errors() {
        let f = fixture(&["c1"]).await;
        f.runner.respond(
            "ip link add",
            CommandOutput::failed("RTNETLINK answers: File exists"),
        );
        f.runner.respond(
            "route add",
            CommandOutput::failed("RTNETLINK answers: File exists"),
        );

        f.bridge.reconcile().await;
        f.bridge.reconcile().await;
        assert!(f.registry.get("c1").await.unwrap().ip.is_some());
    }

    #[tokio::test]
    async fn test_masquerade_rule_not_duplicated() {
        let f = fixture(&[]).await;
        f.runner.respond(
            "-S POSTROUTING",
            CommandOutput::ok(
                "-P POSTROUTING ACCEPT\n-A POSTROUTING -s 10.0.1.0/24 ! -o br0 -j MASQUERADE\n",
            ),
        );

        assert!(!f.bridge.ensure_masquerade().await.unwrap());
        assert!(f.runner.calls_matching("-A POSTROUTING").is_empty());
    }

    #[tokio::test]
    async fn test_masquerade_rule_added_when_missing() {
        let f = fixture(&[]).await;
        f.runner
            .respond("-S POSTROUTING", CommandOutput::ok("-P POSTROUTING ACCEPT\n"));

        assert!(f.bridge.ensure_masquerade().await.unwrap());
        assert_eq!(
            f.runner.calls_matching("-A POSTROUTING"),
            vec!["iptables -t nat -A POSTROUTING -s 10.0.1.0/24 ! -o br0 -j MASQUERADE"]
        );
    }

    #[tokio::test]
    async fn test_init_tolerates_existing_bridge() {
        let f = fixture(&[]).await;
        f.runner.respond(
            "type bridge",
            CommandOutput::failed("RTNETLINK answers: File exists"),
        );
        f.runner.respond(
            "addr add 10.0.1.1/24",
            CommandOutput::failed("RTNETLINK answers: File exists"),
        );
        f.bridge.init().await.unwrap();
        assert_eq!(
            f.runner.calls_matching("sysctl"),
            vec!["sysctl -w net.ipv4.conf.all.forwarding=1"]
        );
    }

    #[tokio::test]
    async fn test_init_fails_on_real_error() {
        let f = fixture(&[]).await;
        f.runner.respond(
            "type bridge",
            CommandOutput::failed("RTNETLINK answers: Operation not permitted"),
        );
        assert!(f.bridge.init().await.is_err());
    }

    #[tokio::test]
    async fn test_init_adopts_plumbed_namespace() {
        let f = fixture(&["c1"]).await;
        f.runner.respond(
            "ip -n c1 addr show veth0c1",
            CommandOutput::ok(
                "5: veth0c1@if6: <BROADCAST,MULTICAST,UP> mtu 1500\n    link/ether 0a:58:0a:00:01:07 brd ff:ff:ff:ff:ff:ff\n    inet 10.0.1.7/24 scope global veth0c1\n",
            ),
        );
        f.bridge.init().await.unwrap();

        let c1 = f.registry.get("c1").await.unwrap();
        assert_eq!(c1.ip, Some("10.0.1.7".parse().unwrap()));
        assert!(c1.has_veth());
        f.runner.reset_calls();
        f.bridge.reconcile().await;
        assert!(f.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_init_skips_foreign_or_duplicate_address() {
        let f = fixture(&["c1", "c2", "c3"]).await;
        let show = |addr: &str| {
            CommandOutput::ok(format!(
                "5: veth0@if6: <BROADCAST,MULTICAST,UP> mtu 1500\n    inet {}/24 scope global\n",
                addr
            ))
        };
        f.runner.respond("ip -n c1 addr show veth0c1", show("192.168.9.9"));
        f.runner.respond("ip -n c2 addr show veth0c2", show("10.0.1.7"));
        f.runner.respond("ip -n c3 addr show veth0c3", show("10.0.1.7"));
        f.bridge.init().await.unwrap();

        let c1 = f.registry.get("c1").await.unwrap();
        assert!(c1.has_veth());
        assert_eq!(c1.ip, None);
        assert_eq!(
            f.registry.get("c2").await.unwrap().ip,
            Some("10.0.1.7".parse().unwrap())
        );
        let c3 = f.registry.get("c3").await.unwrap();
        assert!(c3.has_veth());
        assert_eq!(c3.ip, None);
    }

    #[tokio::test]
    async fn test_long_names_are_rejected() {
        let f = fixture(&["a-very-long-container"]).await;
        f.bridge.reconcile().await;
        assert!(f.runner.calls().is_empty());
        assert!(!f
            .registry
            .get("a-very-long-container")
            .await
            .unwrap()
            .has_veth());
    }

    #[tokio::test]
    async fn test_cleanup_removes_created_pairs() {
        let f = fixture(&["c1"]).await;
        f.bridge.reconcile().await;
        f.runner.reset_calls();
        f.runner.respond(
            "link del veth1c1",
            CommandOutput::failed("Cannot find device \"veth1c1\""),
        );

        f.bridge.cleanup().await;
        assert_eq!(
            f.runner.calls(),
            vec![
                "ip link set br0 down",
                "ip link del br0 type bridge",
                "ip link del veth1c1",
            ]
        );
    }

    #[tokio::test]
    async fn test_update_ignores_pod_network_change() {
        let f = fixture(&[]).await;
        let mut moved = node_a();
        moved.cidr = "10.9.0.0/24".parse().unwrap();
        moved.gateway = "10.9.0.1".parse().unwrap();
        f.bridge
            .update(Arc::new(Topology {
                network: Default::default(),
                nodes: vec![moved],
            }))
            .await;
        assert_eq!(f.bridge.node.load().cidr, node_a().cidr);
    }

    #[tokio::test]
    async fn test_update_keeps_other_node_changes() {
        let f = fixture(&[]).await;
        let mut renamed = node_a();
        renamed.interface = "ens33".into();
        f.bridge
            .update(Arc::new(Topology {
                network: Default::default(),
                nodes: vec![renamed.clone()],
            }))
            .await;
        assert_eq!(**f.bridge.node.load(), renamed);
    }
}
