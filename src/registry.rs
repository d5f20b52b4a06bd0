//! In-memory registry of the network namespaces on this node.
//!
//! Every namespace found under the netns directory (`ip netns add` creates
//! one file per namespace there) becomes a [`Container`] record. Records
//! are handed out by value: a caller that wants to change one mutates its
//! copy and publishes it back with [`Registry::set`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::Container;

/// Outcome of one discovery pass.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Every namespace currently present.
    pub active: BTreeSet<String>,
    /// Namespaces seen for the first time.
    pub added: Vec<String>,
    /// Records dropped because their namespace is gone.
    pub removed: Vec<Container>,
}

pub struct Registry {
    netns_dir: PathBuf,
    containers: Mutex<BTreeMap<String, Container>>,
}

impl Registry {
    pub fn new(netns_dir: impl Into<PathBuf>) -> Self {
        Self {
            netns_dir: netns_dir.into(),
            containers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Lists the namespace directory and merges it into the registry.
    ///
    /// Known records keep their attributes. Records whose namespace has
    /// disappeared are removed; the kernel destroys their veth pair along
    /// with the namespace, and their address becomes free again.
    pub async fn discover(&self) -> Result<Discovery> {
        let active = self.list_namespaces().await?;
        let mut containers = self.containers.lock().await;

        let added: Vec<String> = active
            .iter()
            .filter(|name| !containers.contains_key(*name))
            .cloned()
            .collect();
        for name in &added {
            containers.insert(name.clone(), Container::new(name.clone()));
        }

        let gone: Vec<String> = containers
            .keys()
            .filter(|name| !active.contains(*name))
            .cloned()
            .collect();
        let removed = gone
            .iter()
            .filter_map(|name| containers.remove(name))
            .collect();

        Ok(Discovery {
            active,
            added,
            removed,
        })
    }

    async fn list_namespaces(&self) -> Result<BTreeSet<String>> {
        let io_err = |source: std::io::Error| Error::Io {
            path: self.netns_dir.display().to_string(),
            source,
        };
        let mut names = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(&self.netns_dir).await {
            Ok(entries) => entries,
            // No namespace has ever been created on this host.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(io_err(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let file_type = entry.file_type().await.map_err(io_err)?;
            if file_type.is_dir() {
                continue;
            }
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Publishes a modified copy of a record.
    ///
    /// Returns false, and changes nothing, when the record has been pruned
    /// in the meantime.
    pub async fn set(&self, container: Container) -> bool {
        let mut containers = self.containers.lock().await;
        match containers.get_mut(&container.name) {
            Some(slot) => {
                *slot = container;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, name: &str) -> Option<Container> {
        self.containers.lock().await.get(name).cloned()
    }

    /// All records, ordered by name.
    pub async fn list(&self) -> Vec<Container> {
        self.containers.lock().await.values().cloned().collect()
    }

    /// Addresses currently recorded against any container.
    pub async fn assigned_ips(&self) -> HashSet<Ipv4Addr> {
        self.containers
            .lock()
            .await
            .values()
            .filter_map(|c| c.ip)
            .collect()
    }

    /// Periodically rediscovers namespaces until `cancel` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!(
            "Watching network namespaces in {}",
            self.netns_dir.display()
        );
        loop {
            match self.discover().await {
                Ok(discovery) => {
                    debug!("{} namespaces active", discovery.active.len());
                    for name in &discovery.added {
                        info!("Discovered container {}", name);
                    }
                    for container in &discovery.removed {
                        info!(
                            "Container {} is gone, releasing {:?}",
                            container.name, container.ip
                        );
                    }
                }
                Err(e) => warn!("Namespace discovery failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }
        info!("Container registry stopped");
    }
}
