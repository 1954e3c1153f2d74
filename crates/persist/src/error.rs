use repovault_common::{SnapshotId, Step};
use std::path::PathBuf;

use crate::store::RegistryError;

/// Fatal outcomes of snapshot operations.
///
/// Compression fallback and verification failure are not here: they are
/// recorded on the snapshot and reported through `CreatedSnapshot`.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("{} is not a version-controlled working tree", path.display())]
    NotAVersionControlledTree { path: PathBuf },
    #[error("snapshot {snapshot_id}: capture failed at {step}: {reason}")]
    CaptureFailed {
        snapshot_id: SnapshotId,
        step: Step,
        reason: String,
    },
    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),
    /// The target directory may be partially overwritten.
    #[error("snapshot {snapshot_id}: restore failed at {step}: {reason}")]
    RestoreFailed {
        snapshot_id: SnapshotId,
        step: Step,
        reason: String,
    },
    #[error("snapshot {snapshot_id}: delete failed: {reason}")]
    DeleteFailed {
        snapshot_id: SnapshotId,
        reason: String,
    },
    #[error("registry error: {0}")]
    Registry(RegistryError),
}

impl From<RegistryError> for SnapshotError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => SnapshotError::SnapshotNotFound(id),
            other => SnapshotError::Registry(other),
        }
    }
}

impl SnapshotError {
    /// Snapshot the failure concerns, if any.
    pub fn snapshot_id(&self) -> Option<&SnapshotId> {
        match self {
            SnapshotError::CaptureFailed { snapshot_id, .. }
            | SnapshotError::RestoreFailed { snapshot_id, .. }
            | SnapshotError::DeleteFailed { snapshot_id, .. } => Some(snapshot_id),
            SnapshotError::SnapshotNotFound(id) => Some(id),
            SnapshotError::NotAVersionControlledTree { .. } | SnapshotError::Registry(_) => None,
        }
    }

    /// Pipeline step that failed, if any.
    pub fn step(&self) -> Option<Step> {
        match self {
            SnapshotError::NotAVersionControlledTree { .. } => Some(Step::Preflight),
            SnapshotError::CaptureFailed { step, .. }
            | SnapshotError::RestoreFailed { step, .. } => Some(*step),
            SnapshotError::SnapshotNotFound(_) => Some(Step::Lookup),
            SnapshotError::DeleteFailed { .. } => Some(Step::Delete),
            SnapshotError::Registry(_) => None,
        }
    }
}
