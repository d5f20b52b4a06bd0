//! Data structures shared by every subsystem of the daemon.
//!
//! The topology document is read from YAML on the master and travels as
//! JSON between nodes; container records travel as JSON between peers.
//! Unset container attributes are encoded as empty strings on the wire so
//! that older peers, which never omit a field, keep decoding them.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// How containers on different nodes reach each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Local bridge only; cross-node traffic is left to the underlay.
    Bridge,
    /// Local bridge plus a VXLAN overlay stitching all nodes together.
    #[default]
    Overlay,
}

/// Overlay endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vxlan {
    /// Address assigned to the VXLAN device. Accepts a bare address
    /// (treated as /32) or `address/prefix`.
    #[serde(deserialize_with = "overlay_ip")]
    pub ip: Ipv4Net,
    /// Hardware address of the node's VXLAN device, empty until the
    /// device has been brought up.
    #[serde(default)]
    pub mac: String,
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Underlay interface the VXLAN device is bound to.
    pub interface: String,
    /// Underlay address, also where the node's HTTP API listens.
    pub ip: Ipv4Addr,
    /// Pod network owned by this node.
    pub cidr: Ipv4Net,
    /// Gateway address inside `cidr`, assigned to the bridge.
    pub gateway: Ipv4Addr,
    pub vxlan: Vxlan,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,
}

/// The declarative description of the whole cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Topology {
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    /// Every node except `name`, in document order.
    pub fn peers<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.name != name)
    }

    /// Checks the invariants the controllers rely on.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(Error::InvalidTopology("node with empty name".into()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(Error::InvalidTopology(format!(
                    "duplicate node name {}",
                    node.name
                )));
            }
            if !node.cidr.contains(&node.gateway) {
                return Err(Error::InvalidTopology(format!(
                    "node {}: gateway {} is outside {}",
                    node.name, node.gateway, node.cidr
                )));
            }
        }
        Ok(())
    }

    /// Carries runtime-learned overlay MACs over from `previous` for nodes
    /// whose entry in `self` has none.
    pub fn inherit_macs(&mut self, previous: &Topology) {
        for node in &mut self.nodes {
            if !node.vxlan.mac.is_empty() {
                continue;
            }
            if let Some(old) = previous.node(&node.name) {
                node.vxlan.mac = old.vxlan.mac.clone();
            }
        }
    }
}

/// A network namespace known to this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Namespace name.
    pub name: String,
    #[serde(default, with = "empty_as_none")]
    pub ip: Option<Ipv4Addr>,
    /// Namespace-side end of the veth pair.
    #[serde(default, with = "empty_as_none")]
    pub veth0: Option<String>,
    /// Host-side end of the veth pair, attached to the bridge.
    #[serde(default, with = "empty_as_none")]
    pub veth1: Option<String>,
}

impl Container {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_veth(&self) -> bool {
        self.veth0.is_some() && self.veth1.is_some()
    }
}

/// Parses a MAC address "aa:bb:cc:dd:ee:ff" into 6 bytes.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let invalid = || Error::InvalidMac(s.to_string());
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(invalid());
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(invalid());
        }
        mac[i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    Ok(mac)
}

/// Parses an overlay address given either as `a.b.c.d` or `a.b.c.d/len`.
pub fn parse_overlay_ip(s: &str) -> Option<Ipv4Net> {
    let s = s.trim();
    if let Ok(net) = s.parse::<Ipv4Net>() {
        return Some(net);
    }
    s.parse::<Ipv4Addr>()
        .ok()
        .and_then(|addr| Ipv4Net::new(addr, 32).ok())
}

fn overlay_ip<'de, D>(deserializer: D) -> std::result::Result<Ipv4Net, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_overlay_ip(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid overlay address '{}'", raw)))
}

mod empty_as_none {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(v) => v.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }
}
