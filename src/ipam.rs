//! Address allocation inside a node's pod CIDR.
//!
//! A single lock serializes every allocation on the node. An address handed
//! to a container stays reserved under that container's name until the
//! registry records it (or the container disappears), so a second caller can
//! never receive it while the first is still plumbing the namespace.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use log::debug;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::types::Node;

/// First address of `cidr` not in `reserved`, in numeric order.
///
/// The network and broadcast addresses are never returned for prefixes
/// shorter than /31.
pub fn first_free(cidr: Ipv4Net, reserved: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    cidr.hosts().find(|ip| !reserved.contains(ip))
}

pub struct Ipam {
    registry: Arc<Registry>,
    /// Addresses handed out but not yet recorded, by container name.
    pending: Mutex<HashMap<String, Ipv4Addr>>,
}

impl Ipam {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Scans the CIDR, skipping the node's own addresses, every recorded
    /// container address and every pending reservation.
    async fn find_available_ip(
        &self,
        node: &Node,
        pending: &HashMap<String, Ipv4Addr>,
    ) -> Result<Ipv4Addr> {
        let mut reserved = self.registry.assigned_ips().await;
        reserved.insert(node.vxlan.ip.addr());
        reserved.insert(node.gateway);
        reserved.extend(pending.values().copied());
        first_free(node.cidr, &reserved).ok_or(Error::NoAvailableAddress(node.cidr))
    }

    /// Picks an address for `container` and holds it until recorded.
    ///
    /// Repeated calls for the same container return the same address, so a
    /// retried attachment re-issues identical commands.
    pub async fn allocate(&self, node: &Node, container: &str) -> Result<Ipv4Addr> {
        let mut pending = self.pending.lock().await;

        // Drop reservations that are recorded or whose container is gone.
        let unrecorded: HashSet<String> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|c| c.ip.is_none())
            .map(|c| c.name)
            .collect();
        pending.retain(|name, _| unrecorded.contains(name));

        if let Some(ip) = pending.get(container) {
            if node.cidr.contains(ip) {
                return Ok(*ip);
            }
        }
        pending.remove(container);

        let ip = self.find_available_ip(node, &pending).await?;
        debug!("Reserved {} for {}", ip, container);
        pending.insert(container.to_string(), ip);
        Ok(ip)
    }
}
