//! Typed operations over the host network configuration surface.
//!
//! Each operation returns an [`Invocation`] describing what ran and how it
//! ended. Whether a failure is acceptable is decided by the caller with
//! [`Invocation::tolerate`] and one of the marker lists below, because the
//! same command can be benign in one place and fatal in another.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};
use crate::runtime::{CommandOutput, CommandRunner};

/// Failures meaning the requested object is already in place.
pub const EXISTS: &[&str] = &["File exists", "already exists"];
/// Failures meaning the object to remove is already gone.
pub const GONE: &[&str] = &["Cannot find device", "does not exist", "No such file or directory"];

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

/// Returns true when `output` contains any of the `benign` markers.
pub fn is_benign(output: &str, benign: &[&str]) -> bool {
    benign.iter().any(|marker| output.contains(marker))
}

/// A finished control-surface command.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: String,
    pub result: CommandOutput,
}

impl Invocation {
    /// Requires the command to have succeeded.
    pub fn ok(self) -> Result<String> {
        self.tolerate(&[])
    }

    /// Accepts success, or a failure whose output carries a benign marker.
    pub fn tolerate(self, benign: &[&str]) -> Result<String> {
        if self.result.success || is_benign(&self.result.output, benign) {
            Ok(self.result.output)
        } else {
            Err(Error::Command {
                command: self.command,
                output: self.result.output.trim().to_string(),
            })
        }
    }
}

#[derive(Clone)]
pub struct NetCtl {
    runner: Arc<dyn CommandRunner>,
}

impl NetCtl {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn exec(&self, program: &str, args: &[&str]) -> Result<Invocation> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let result = self.runner.run(program, &args).await?;
        Ok(Invocation {
            command: format!("{} {}", program, args.join(" ")),
            result,
        })
    }

    /// `ip` on the host, or inside `netns` when given.
    async fn ip(&self, netns: Option<&str>, args: &[&str]) -> Result<Invocation> {
        match netns {
            Some(ns) => {
                let mut full = vec!["-n", ns];
                full.extend_from_slice(args);
                self.exec("ip", &full).await
            }
            None => self.exec("ip", args).await,
        }
    }

    #[cfg(test)]
    pub async fn create_namespace(&self, netns: &str) -> Result<Invocation> {
        self.ip(None, &["netns", "add", netns]).await
    }

    #[cfg(test)]
    pub async fn delete_namespace(&self, netns: &str) -> Result<Invocation> {
        self.ip(None, &["netns", "del", netns]).await
    }

    pub async fn create_veth_pair(&self, veth0: &str, veth1: &str) -> Result<Invocation> {
        self.ip(None, &["link", "add", veth0, "type", "veth", "peer", "name", veth1])
            .await
    }

    pub async fn move_to_namespace(&self, link: &str, netns: &str) -> Result<Invocation> {
        self.ip(None, &["link", "set", link, "netns", netns]).await
    }

    pub async fn create_bridge(&self, bridge: &str) -> Result<Invocation> {
        self.ip(None, &["link", "add", "name", bridge, "type", "bridge"])
            .await
    }

    pub async fn delete_bridge(&self, bridge: &str) -> Result<Invocation> {
        self.ip(None, &["link", "del", bridge, "type", "bridge"]).await
    }

    pub async fn delete_link(&self, link: &str) -> Result<Invocation> {
        self.ip(None, &["link", "del", link]).await
    }

    pub async fn attach_to_bridge(&self, link: &str, bridge: &str) -> Result<Invocation> {
        self.ip(None, &["link", "set", link, "master", bridge]).await
    }

    pub async fn set_link_up(&self, netns: Option<&str>, link: &str) -> Result<Invocation> {
        self.ip(netns, &["link", "set", link, "up"]).await
    }

    pub async fn set_link_down(&self, link: &str) -> Result<Invocation> {
        self.ip(None, &["link", "set", link, "down"]).await
    }

    pub async fn assign_address(
        &self,
        netns: Option<&str>,
        link: &str,
        addr: &str,
    ) -> Result<Invocation> {
        self.ip(netns, &["addr", "add", addr, "dev", link]).await
    }

    pub async fn show_interface(&self, netns: Option<&str>, link: &str) -> Result<Invocation> {
        self.ip(netns, &["addr", "show", link]).await
    }

    pub async fn add_default_route(
        &self,
        netns: &str,
        gateway: Ipv4Addr,
        link: &str,
    ) -> Result<Invocation> {
        let gateway = gateway.to_string();
        self.ip(
            Some(netns),
            &["route", "add", "default", "via", gateway.as_str(), "dev", link],
        )
        .await
    }

    pub async fn add_route(&self, cidr: Ipv4Net, link: &str) -> Result<Invocation> {
        let cidr = cidr.to_string();
        self.ip(None, &["route", "add", cidr.as_str(), "dev", link]).await
    }

    pub async fn create_vxlan(
        &self,
        name: &str,
        vni: u32,
        local: Ipv4Addr,
        dev: &str,
        dstport: u16,
    ) -> Result<Invocation> {
        let vni = vni.to_string();
        let local = local.to_string();
        let dstport = dstport.to_string();
        self.ip(
            None,
            &[
                "link",
                "add",
                name,
                "type",
                "vxlan",
                "id",
                vni.as_str(),
                "local",
                local.as_str(),
                "dev",
                dev,
                "dstport",
                dstport.as_str(),
                "nolearning",
            ],
        )
        .await
    }

    /// Points `ip` at `mac`, creating the entry or overwriting a stale one.
    pub async fn replace_neighbor(
        &self,
        ip: Ipv4Addr,
        mac: &str,
        dev: &str,
    ) -> Result<Invocation> {
        let ip = ip.to_string();
        self.ip(
            None,
            &["neighbor", "replace", ip.as_str(), "lladdr", mac, "dev", dev],
        )
        .await
    }

    pub async fn append_fdb(&self, mac: &str, dev: &str, dst: Ipv4Addr) -> Result<Invocation> {
        let dst = dst.to_string();
        self.exec("bridge", &["fdb", "append", mac, "dev", dev, "dst", dst.as_str()])
            .await
    }

    pub async fn list_nat_rules(&self, chain: &str) -> Result<Invocation> {
        self.exec("iptables", &["-t", "nat", "-S", chain]).await
    }

    pub async fn add_nat_rule(&self, chain: &str, rule: &[&str]) -> Result<Invocation> {
        let mut args = vec!["-t", "nat", "-A", chain];
        args.extend_from_slice(rule);
        self.exec("iptables", &args).await
    }

    pub async fn set_forwarding(&self) -> Result<Invocation> {
        self.exec("sysctl", &["-w", "net.ipv4.conf.all.forwarding=1"])
            .await
    }
}
