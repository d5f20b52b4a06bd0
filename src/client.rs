//! HTTP client for talking to other nodes.
//!
//! Peers are reached at their underlay address on the cluster port; the
//! master is reached at its configured `host:port`. Certificates are not
//! verified: the cluster network is trusted.

use std::fmt::Display;
use std::net::Ipv4Addr;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::{Container, Topology};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MacReport<'a> {
    node_name: &'a str,
    mac: &'a str,
}

#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    port: u16,
}

impl PeerClient {
    /// Every request made through this client gives up after `timeout`.
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self { http, port })
    }

    fn peer_url(&self, ip: Ipv4Addr, path: &str) -> String {
        format!("http://{}:{}{}", ip, self.port, path)
    }

    async fn checked(url: String, resp: reqwest::Response) -> Result<String> {
        let status = resp.status();
        let body = resp.text().await?;
        if status != StatusCode::OK {
            return Err(Error::Status {
                url,
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        Ok(body)
    }

    async fn get(&self, url: String) -> Result<String> {
        let resp = self.http.get(&url).send().await?;
        Self::checked(url, resp).await
    }

    /// Containers known to the peer at `ip`.
    pub async fn containers(&self, ip: Ipv4Addr) -> Result<Vec<Container>> {
        let body = self.get(self.peer_url(ip, "/containers")).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Overlay MAC of the peer at `ip`; fails until the peer's VXLAN
    /// device is up.
    pub async fn vxlan_mac(&self, ip: Ipv4Addr) -> Result<String> {
        let body = self.get(self.peer_url(ip, "/vxlan/mac")).await?;
        Ok(body.trim().to_string())
    }

    /// Full topology held by the master at `master` (`host:port`).
    pub async fn topology(&self, master: impl Display) -> Result<Topology> {
        let body = self.get(format!("http://{}/store", master)).await?;
        let topology: Topology = serde_json::from_str(&body)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Reports this node's overlay MAC to the master.
    pub async fn publish_vxlan_mac(
        &self,
        master: impl Display,
        node_name: &str,
        mac: &str,
    ) -> Result<()> {
        let url = format!("http://{}/vxlan/mac", master);
        let resp = self
            .http
            .post(&url)
            .json(&MacReport { node_name, mac })
            .send()
            .await?;
        Self::checked(url, resp).await.map(|_| ())
    }
}
