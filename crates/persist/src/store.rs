//! File-backed snapshot registry.
//!
//! Layout inside the snapshot root:
//! ```text
//! snapshot_registry.json   - every SnapshotMetadata, in creation order
//! <snapshot_id>/
//!   metadata.json          - copy of that snapshot's registry entry
//!   <repo_name>.tar[.zst]  - clean capture
//!   dirty_state/           - modified and untracked files
//!   deleted_files.json     - tracked files deleted in the working tree
//! ```

use repovault_common::{SnapshotId, SnapshotMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Registry document file name inside the snapshot root.
pub const REGISTRY_FILE: &str = "snapshot_registry.json";
/// Per-snapshot mirror of the registry entry.
pub const METADATA_FILE: &str = "metadata.json";
/// Per-snapshot list of tracked paths absent from the working tree.
pub const DELETIONS_FILE: &str = "deleted_files.json";

const REGISTRY_SCHEMA_VERSION: u32 = 1;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("snapshot {0} not found")]
    NotFound(SnapshotId),
}

/// On-disk shape of `snapshot_registry.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDocument {
    schema_version: u32,
    snapshots: Vec<SnapshotMetadata>,
    /// Secondary lookup, rebuilt from `snapshots` on load.
    repositories: BTreeMap<String, Vec<SnapshotId>>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            schema_version: REGISTRY_SCHEMA_VERSION,
            snapshots: Vec::new(),
            repositories: BTreeMap::new(),
        }
    }
}

impl RegistryDocument {
    fn reindex(&mut self) {
        self.repositories.clear();
        for meta in &self.snapshots {
            self.repositories
                .entry(meta.repo_name.clone())
                .or_default()
                .push(meta.snapshot_id.clone());
        }
    }

    fn position(&self, id: &SnapshotId) -> Option<usize> {
        self.snapshots.iter().position(|m| &m.snapshot_id == id)
    }
}

/// Durable index of every snapshot under one root directory.
///
/// Every mutation rewrites the whole document through a temp file and a
/// rename, so readers see either the old or the new registry.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    doc: RegistryDocument,
}

impl Registry {
    /// Open the registry at `root`, creating the directory when needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|source| RegistryError::Io {
            path: root.clone(),
            source,
        })?;

        let path = root.join(REGISTRY_FILE);
        let doc = match std::fs::read(&path) {
            Ok(bytes) => {
                let mut doc: RegistryDocument =
                    serde_json::from_slice(&bytes).map_err(|source| RegistryError::Json {
                        path: path.clone(),
                        source,
                    })?;
                if doc.schema_version != REGISTRY_SCHEMA_VERSION {
                    return Err(RegistryError::SchemaMismatch {
                        file_version: doc.schema_version,
                        expected_version: REGISTRY_SCHEMA_VERSION,
                    });
                }
                doc.reindex();
                doc
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryDocument::default(),
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        tracing::debug!(root = %root.display(), snapshots = doc.snapshots.len(), "registry opened");
        Ok(Self { root, doc })
    }

    /// The snapshot root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the payload of `id`.
    pub fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Insert or replace the entry for `meta.snapshot_id` and persist.
    pub fn register(&mut self, meta: SnapshotMetadata) -> Result<(), RegistryError> {
        let mut next = self.doc.clone();
        match next.position(&meta.snapshot_id) {
            Some(i) => next.snapshots[i] = meta,
            None => next.snapshots.push(meta),
        }
        next.reindex();
        self.save(&next)?;
        self.doc = next;
        Ok(())
    }

    /// Remove the entry for `id` and persist. Returns the removed record.
    pub fn remove(&mut self, id: &SnapshotId) -> Result<SnapshotMetadata, RegistryError> {
        let mut next = self.doc.clone();
        let i = next
            .position(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let removed = next.snapshots.remove(i);
        next.reindex();
        self.save(&next)?;
        self.doc = next;
        Ok(removed)
    }

    /// Look up one snapshot.
    pub fn get(&self, id: &SnapshotId) -> Result<&SnapshotMetadata, RegistryError> {
        self.doc
            .snapshots
            .iter()
            .find(|m| &m.snapshot_id == id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &SnapshotId) -> bool {
        self.doc.position(id).is_some()
    }

    /// Entries in creation order, optionally limited to one repository.
    pub fn list(&self, repo_name: Option<&str>) -> Vec<&SnapshotMetadata> {
        match repo_name {
            None => self.doc.snapshots.iter().collect(),
            Some(name) => self
                .doc
                .repositories
                .get(name)
                .map(|ids| ids.iter().filter_map(|id| self.get(id).ok()).collect())
                .unwrap_or_default(),
        }
    }

    /// Repository names with at least one snapshot.
    pub fn repositories(&self) -> impl Iterator<Item = &str> {
        self.doc.repositories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.doc.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.snapshots.is_empty()
    }

    fn save(&self, doc: &RegistryDocument) -> Result<(), RegistryError> {
        write_json_atomic(&self.root.join(REGISTRY_FILE), doc)
    }
}

/// Serialize `value` to `path` via temp file, fsync and rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), RegistryError> {
    let io_err = |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(value).map_err(|source| RegistryError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!("{file_name}.tmp.{}", std::process::id()));

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(&json)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, path)
    };
    if let Err(e) = write() {
        if let Err(cleanup) = std::fs::remove_file(&temp_path) {
            tracing::debug!(path = %temp_path.display(), error = %cleanup, "temp file left behind");
        }
        return Err(io_err(e));
    }
    Ok(())
}

/// Read a `metadata.json` file.
pub fn read_metadata(path: &Path) -> Result<SnapshotMetadata, RegistryError> {
    let bytes = std::fs::read(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| RegistryError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a deletion list. A snapshot without one deleted nothing.
pub fn read_deletions(path: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(RegistryError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes).map_err(|source| RegistryError::Json {
        path: path.to_path_buf(),
        source,
    })
}
