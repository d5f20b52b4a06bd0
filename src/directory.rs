//! What this node tells the rest of the cluster about itself.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::store::TopologyStore;
use crate::types::{Container, Node};

pub struct Directory {
    node_name: String,
    store: Arc<TopologyStore>,
    registry: Arc<Registry>,
    /// Set once the overlay device is up.
    vxlan_mac: RwLock<Option<String>>,
}

impl Directory {
    pub fn new(node_name: String, store: Arc<TopologyStore>, registry: Arc<Registry>) -> Self {
        Self {
            node_name,
            store,
            registry,
            vxlan_mac: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<TopologyStore> {
        &self.store
    }

    /// This node's entry in the current topology.
    pub fn current_node(&self) -> Result<Node> {
        self.store
            .snapshot()
            .node(&self.node_name)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(self.node_name.clone()))
    }

    pub async fn vxlan_mac(&self) -> Option<String> {
        self.vxlan_mac.read().await.clone()
    }

    pub async fn set_vxlan_mac(&self, mac: String) {
        *self.vxlan_mac.write().await = Some(mac);
    }

    pub async fn containers(&self) -> Vec<Container> {
        self.registry.list().await
    }
}
