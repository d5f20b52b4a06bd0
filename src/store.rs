//! The cluster topology as seen by this node.
//!
//! Readers take an `Arc<Topology>` snapshot and never observe a partially
//! replaced document. Writers are serialized so that a reload and a MAC
//! update cannot interleave, and every registered [`TopologyConsumer`] is
//! told about each real change exactly once.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::types::Topology;

/// Receives every new topology snapshot.
#[async_trait]
pub trait TopologyConsumer: Send + Sync {
    async fn update(&self, topology: Arc<Topology>);
}

/// Parses and validates a YAML topology document.
pub fn parse_topology(yaml: &str) -> Result<Topology> {
    if yaml.trim().is_empty() {
        return Err(Error::InvalidTopology("empty document".into()));
    }
    let topology: Topology = serde_yaml::from_str(yaml)?;
    topology.validate()?;
    Ok(topology)
}

pub async fn read_topology(path: &Path) -> Result<Topology> {
    let yaml = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
    parse_topology(&yaml)
}

pub struct TopologyStore {
    current: ArcSwap<Topology>,
    consumers: RwLock<Vec<Arc<dyn TopologyConsumer>>>,
    write: Mutex<()>,
}

impl TopologyStore {
    pub fn new(topology: Topology) -> Self {
        Self {
            current: ArcSwap::from_pointee(topology),
            consumers: RwLock::new(Vec::new()),
            write: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<Topology> {
        self.current.load_full()
    }

    pub async fn register(&self, consumer: Arc<dyn TopologyConsumer>) {
        self.consumers.write().await.push(consumer);
    }

    /// Pushes the current snapshot to every consumer.
    pub async fn notify_all(&self) {
        let _guard = self.write.lock().await;
        self.notify(self.snapshot()).await;
    }

    async fn notify(&self, topology: Arc<Topology>) {
        let consumers = self.consumers.read().await.clone();
        debug!("Sending topology to {} consumers", consumers.len());
        for consumer in consumers {
            consumer.update(Arc::clone(&topology)).await;
        }
    }

    /// Installs `topology` if it differs from the current snapshot.
    ///
    /// Returns whether anything changed; consumers are only notified then.
    pub async fn replace(&self, topology: Topology) -> bool {
        let _guard = self.write.lock().await;
        self.swap(topology).await
    }

    /// Like [`replace`](Self::replace) for a document re-read from disk:
    /// overlay MACs learned at runtime survive when the file has none.
    pub async fn reload(&self, mut topology: Topology) -> bool {
        let _guard = self.write.lock().await;
        topology.inherit_macs(&self.current.load());
        self.swap(topology).await
    }

    async fn swap(&self, topology: Topology) -> bool {
        if **self.current.load() == topology {
            return false;
        }
        let topology = Arc::new(topology);
        self.current.store(Arc::clone(&topology));
        info!("Topology updated: {} nodes", topology.nodes.len());
        self.notify(topology).await;
        true
    }

    /// Records the overlay MAC a node reported.
    pub async fn set_vxlan_mac(&self, node_name: &str, mac: &str) -> Result<()> {
        let _guard = self.write.lock().await;
        let mut next = Topology::clone(&self.current.load());
        let node = next
            .node_mut(node_name)
            .ok_or_else(|| Error::NodeNotFound(node_name.to_string()))?;
        if node.vxlan.mac == mac {
            return Ok(());
        }
        node.vxlan.mac = mac.to_string();
        info!("Node {} overlay MAC is {}", node_name, mac);
        self.current.store(Arc::new(next));
        Ok(())
    }
}
