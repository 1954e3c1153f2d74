//! Snapshot persistence: compression, integrity verification, the registry,
//! and the manager that ties capture, storage and restore together.
//!
//! # Invariants
//! - A registry entry is written last during create; no entry exists for a
//!   snapshot whose capture failed.
//! - `metadata.json` is rewritten whenever its registry entry is.
//! - Falling back to uncompressed storage and failing verification are
//!   recorded outcomes, never errors.
//! - The verification hash covers the archive, `dirty_state/` and the
//!   deletion list; restore checks it before writing anything.
//! - Delete removes the directory first, then the registry entry.

pub mod archive;
pub mod codec;
mod config;
mod error;
mod snapshot;
mod store;
pub mod verify;

pub use codec::{Codec, CodecError, Compressor};
pub use config::{ConfigError, SnapshotConfig};
pub use error::SnapshotError;
pub use snapshot::{
    CompressionStatus, CreatedSnapshot, OrphanReport, RestoreMode, RestoreReport,
    SnapshotManager, VerificationReport,
};
pub use store::{
    DELETIONS_FILE, METADATA_FILE, REGISTRY_FILE, Registry, RegistryError, read_deletions,
    read_metadata,
};
pub use verify::VerificationStatus;

pub use repovault_common::{CompressionFormat, SnapshotId, SnapshotMetadata, Step};
pub use repovault_vcs::{DIRTY_STATE_DIR, GitCli, VcsError, VersionControl};
