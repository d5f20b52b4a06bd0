use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where this node's topology comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRole {
    /// Read `topology_path` once at startup.
    None,
    /// Own `topology_path`, watch it and serve it to followers.
    Master,
    /// Poll the master at `master_addr`.
    Follower,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub node_name: String,
    pub topology_path: PathBuf,
    pub sync: SyncRole,
    /// `host:port` of the master, required for followers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_addr: Option<String>,
    pub listen_port: u16,
    pub netns_dir: PathBuf,
    pub bridge_name: String,
    pub veth_prefix: String,
    pub vxlan_name: String,
    pub vxlan_id: u32,
    pub vxlan_port: u16,
    pub tick_secs: u64,
    pub sync_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Remove the bridge, veths and VXLAN device on shutdown.
    pub cleanup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            topology_path: "topology.yaml".into(),
            sync: SyncRole::None,
            master_addr: None,
            listen_port: 8080,
            netns_dir: "/var/run/netns".into(),
            bridge_name: "br0".into(),
            veth_prefix: "veth".into(),
            vxlan_name: "vxlan100".into(),
            vxlan_id: 100,
            vxlan_port: 4789,
            tick_secs: 5,
            sync_interval_secs: 5,
            request_timeout_secs: 3,
            cleanup: true,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("podnet.toml"))
            .merge(Json::file("podnet.json"));
        // An explicit file wins over the working-directory defaults.
        if let Ok(path) = std::env::var("PODNET_CONFIG") {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed("PODNET_").ignore(&["config"])))
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Fall back to the host name, as most deployments name nodes after hosts.
        if config.node_name.is_empty() {
            if let Ok(host) = std::env::var("HOSTNAME") {
                config.node_name = host.trim().to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("node_name must be set (PODNET_NODE_NAME)");
        }
        if self.sync == SyncRole::Follower && self.master_addr.is_none() {
            anyhow::bail!("master_addr is required when sync = \"follower\"");
        }
        if self.tick_secs == 0 || self.sync_interval_secs == 0 {
            anyhow::bail!("tick_secs and sync_interval_secs must be non-zero");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be non-zero");
        }
        if self.veth_prefix.is_empty()
            || self.bridge_name.is_empty()
            || self.vxlan_name.is_empty()
        {
            anyhow::bail!("interface names must not be empty");
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
