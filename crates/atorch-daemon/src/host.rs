//! Snapshot backed host platform
//!
//! Keeps the accessory snapshot in memory. Every register, update and
//! unregister call serializes the document and hands it to a
//! [`SnapshotWriter`], which writes it off the bridge loop. Queued documents
//! are coalesced so a burst of discoveries costs one write.

use atorch_core::{write_atomic, Accessory, BridgeError, Result, Snapshot, SnapshotError};
use atorch_discovery::HostPlatform;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub struct SnapshotHost {
    snapshot: Mutex<Snapshot>,
    writes: mpsc::UnboundedSender<Vec<u8>>,
}

/// Writes serialized snapshots to disk until every host handle is dropped
pub struct SnapshotWriter {
    path: PathBuf,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl SnapshotHost {
    /// Open the snapshot at `path`, starting empty when the file is missing.
    /// The returned writer must be spawned for changes to reach the disk.
    pub fn open(
        path: impl Into<PathBuf>,
    ) -> std::result::Result<(Self, SnapshotWriter), SnapshotError> {
        let path = path.into();
        let snapshot = Snapshot::load_or_create(&path)?;
        info!(path = %path.display(), accessories = snapshot.len(), "Loaded accessory snapshot");

        let (writes, rx) = mpsc::unbounded_channel();
        let host = Self {
            snapshot: Mutex::new(snapshot),
            writes,
        };
        Ok((host, SnapshotWriter { path, rx }))
    }

    /// Accessories to hand back to the bridge at startup
    pub fn restored(&self) -> Vec<Accessory> {
        self.lock().accessories()
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, apply: impl FnOnce(&mut Snapshot)) -> Result<()> {
        let content = {
            let mut snapshot = self.lock();
            apply(&mut *snapshot);
            snapshot
                .to_bytes()
                .map_err(|e| BridgeError::Host(format!("encoding snapshot: {e}")))?
        };
        self.writes
            .send(content)
            .map_err(|_| BridgeError::Host("snapshot writer stopped".to_string()))
    }
}

impl SnapshotWriter {
    pub async fn run(mut self) {
        while let Some(mut content) = self.rx.recv().await {
            // Only the newest document matters
            while let Ok(newer) = self.rx.try_recv() {
                content = newer;
            }

            let path = self.path.clone();
            match tokio::task::spawn_blocking(move || write_atomic(&path, &content)).await {
                Ok(Ok(())) => debug!(path = %self.path.display(), "Snapshot saved"),
                Ok(Err(e)) => {
                    error!(path = %self.path.display(), error = %e, "Failed to save snapshot")
                }
                Err(e) => error!(error = %e, "Snapshot write task failed"),
            }
        }
        debug!("Snapshot writer stopped");
    }
}

impl HostPlatform for SnapshotHost {
    fn register_accessories(&self, accessories: &[&Accessory]) -> Result<()> {
        for accessory in accessories {
            info!(name = %accessory.display_name, id = %accessory.id, "Registering accessory");
        }
        self.persist(|snapshot| accessories.iter().for_each(|a| snapshot.upsert(a)))
    }

    fn unregister_accessories(&self, accessories: &[&Accessory]) -> Result<()> {
        for accessory in accessories {
            info!(name = %accessory.display_name, id = %accessory.id, "Unregistering accessory");
        }
        self.persist(|snapshot| {
            for accessory in accessories {
                snapshot.remove(&accessory.id);
            }
        })
    }

    fn update_accessories(&self, accessories: &[&Accessory]) -> Result<()> {
        debug!(count = accessories.len(), "Updating accessories");
        self.persist(|snapshot| accessories.iter().for_each(|a| snapshot.upsert(a)))
    }
}
