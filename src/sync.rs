//! Keeps the topology store in step with the rest of the cluster.
//!
//! The master watches the directory holding its topology file with inotify,
//! so both in-place writes and rename-replacement wake it, and falls back to
//! polling when no watch can be set up. Every wake-up is checked against a
//! content hash before the file is re-read. A follower polls the master's
//! `/store` endpoint. Either way a snapshot is
//! only replaced by a document that parsed and validated, and consumers are
//! only notified when the document actually changed.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::client::PeerClient;
use crate::store::{read_topology, TopologyStore};

/// A file and the hash of its contents when last seen.
struct PathAndHash {
    path: PathBuf,
    hash: Option<Vec<u8>>,
}

impl PathAndHash {
    async fn new(path: &Path) -> Self {
        let hash = hash_file(path).await.ok();
        Self {
            path: path.to_path_buf(),
            hash,
        }
    }

    async fn has_changed(&mut self) -> io::Result<bool> {
        let hash = hash_file(&self.path).await?;
        if self.hash.as_ref() == Some(&hash) {
            return Ok(false);
        }
        trace!("{} now hashes to {}", self.path.display(), hex::encode(&hash));
        self.hash = Some(hash);
        Ok(true)
    }
}

async fn hash_file(path: &Path) -> io::Result<Vec<u8>> {
    let contents = tokio::fs::read(path).await?;
    Ok(Sha256::digest(&contents).to_vec())
}

#[cfg(target_os = "linux")]
mod watch {
    use std::ffi::OsString;
    use std::io;
    use std::path::Path;
    use std::pin::Pin;

    use futures_util::StreamExt;
    use inotify::{EventStream, Inotify, WatchMask};
    use log::trace;

    /// Change notifications for one file, taken from its parent directory
    /// so that the file being replaced by a rename is still seen.
    pub struct FileEvents {
        stream: Pin<Box<EventStream<[u8; 4096]>>>,
        name: OsString,
    }

    impl FileEvents {
        pub fn new(path: &Path) -> io::Result<Self> {
            let name = path
                .file_name()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a file path"))?
                .to_os_string();
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            let inotify = Inotify::init()?;
            let mask = WatchMask::CREATE
                | WatchMask::MODIFY
                | WatchMask::CLOSE_WRITE
                | WatchMask::DELETE
                | WatchMask::MOVED_TO
                | WatchMask::MOVED_FROM;
            inotify.watches().add(dir, mask)?;
            trace!("watch {} (for {:?})", dir.display(), name);
            let stream = inotify.into_event_stream([0u8; 4096])?;
            Ok(Self {
                stream: Box::pin(stream),
                name,
            })
        }

        /// Waits for an event naming the watched file. `None` once the
        /// stream has ended.
        pub async fn next(&mut self) -> Option<io::Result<()>> {
            while let Some(event) = self.stream.next().await {
                match event {
                    Ok(event) if event.name.as_deref() == Some(self.name.as_os_str()) => {
                        trace!("event={:?}", event.mask);
                        return Some(Ok(()));
                    }
                    Ok(_) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod watch {
    use std::io;
    use std::path::Path;

    pub struct FileEvents;

    impl FileEvents {
        pub fn new(_path: &Path) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "inotify is only available on Linux",
            ))
        }

        pub async fn next(&mut self) -> Option<io::Result<()>> {
            None
        }
    }
}

use watch::FileEvents;

async fn next_event(events: &mut Option<FileEvents>) -> Option<io::Result<()>> {
    match events {
        Some(events) => events.next().await,
        None => std::future::pending().await,
    }
}

/// Reloads the store from `path` whenever the file's contents change.
///
/// `interval` paces the fallback poll; with a working watch it only bounds
/// how long a missed notification can go unnoticed.
pub async fn run_master(
    store: Arc<TopologyStore>,
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Watching {} for topology changes", path.display());
    let mut file = PathAndHash::new(&path).await;
    let mut events = match FileEvents::new(&path) {
        Ok(events) => Some(events),
        Err(e) => {
            warn!("inotify init error: {}, falling back to polling", e);
            None
        }
    };
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => None,
            event = next_event(&mut events) => Some(event),
        };
        match event {
            Some(None) => {
                warn!("Watch on {} ended, polling from now on", path.display());
                events = None;
            }
            Some(Some(Err(e))) => {
                warn!("watch error: {}, polling from now on", e);
                events = None;
            }
            Some(Some(Ok(()))) | None => {}
        }
        match file.has_changed().await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Editors often replace the file; wait for it to reappear.
                debug!("{} is missing", path.display());
                continue;
            }
            Err(e) => {
                warn!("Failed to hash {}: {}", path.display(), e);
                continue;
            }
        }
        match read_topology(&path).await {
            Ok(topology) => {
                if !store.reload(topology).await {
                    debug!("{} changed but the topology did not", path.display());
                }
            }
            Err(e) => warn!("Keeping current topology: {}", e),
        }
    }
    info!("Topology watcher stopped");
}

/// Mirrors the master's topology into the local store.
pub async fn run_follower(
    store: Arc<TopologyStore>,
    client: PeerClient,
    master: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Following topology from {}", master);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
        match client.topology(&master).await {
            Ok(topology) => {
                store.replace(topology).await;
            }
            Err(e) => warn!("Failed to fetch topology from {}: {}", master, e),
        }
    }
    info!("Topology follower stopped");
}
