//! Accessory snapshot persisted across restarts
//!
//! The snapshot is a flat key/value JSON document: accessory id to display
//! name plus the accessory context. It is the only durable state of the
//! bridge. Services and topic routes are rebuilt from live discovery traffic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::accessory::{Accessory, AccessoryContext};
use crate::identity::AccessoryId;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Persisted state of a single accessory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub display_name: String,
    #[serde(default)]
    pub context: AccessoryContext,
}

/// Snapshot document holding every accessory known to the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Version of the snapshot format
    #[serde(default = "default_version")]
    pub version: String,
    /// When the snapshot was last written (RFC 3339)
    #[serde(default)]
    pub saved_at: Option<String>,
    /// Accessory entries keyed by accessory id
    #[serde(default)]
    pub accessories: BTreeMap<AccessoryId, SnapshotEntry>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Snapshot {
    /// Create a new empty snapshot
    pub fn new() -> Self {
        Self {
            version: default_version(),
            saved_at: None,
            accessories: BTreeMap::new(),
        }
    }

    /// Load snapshot from a file
    pub fn from_file(path: &Path) -> Result<Self, SnapshotError> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        Ok(snapshot)
    }

    /// Load snapshot or create new if file doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self, SnapshotError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Serialize the snapshot, stamping the save time
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, SnapshotError> {
        self.saved_at = Some(chrono::Utc::now().to_rfc3339());
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Save snapshot to a file
    pub fn save(&mut self, path: &Path) -> Result<(), SnapshotError> {
        let content = self.to_bytes()?;
        write_atomic(path, &content)
    }

    /// Add or replace the entry for an accessory
    pub fn upsert(&mut self, accessory: &Accessory) {
        self.accessories.insert(
            accessory.id,
            SnapshotEntry {
                display_name: accessory.display_name.clone(),
                context: accessory.context.clone(),
            },
        );
    }

    /// Drop an accessory, returns true if it was present
    pub fn remove(&mut self, id: &AccessoryId) -> bool {
        self.accessories.remove(id).is_some()
    }

    pub fn contains(&self, id: &AccessoryId) -> bool {
        self.accessories.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.accessories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessories.is_empty()
    }

    /// Accessories ready to be handed to the registry at startup
    pub fn accessories(&self) -> Vec<Accessory> {
        self.accessories
            .iter()
            .map(|(id, entry)| {
                Accessory::restored(*id, entry.display_name.clone(), entry.context.clone())
            })
            .collect()
    }
}

/// Write `content` next to `path` and rename it into place, so readers see
/// either the previous document or the new one, never a partial write.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let temp = temp_path(path);
    if let Err(e) = std::fs::write(&temp, content) {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }
    std::fs::rename(&temp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
