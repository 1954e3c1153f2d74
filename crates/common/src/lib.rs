//! Shared data model: snapshot identifiers, metadata records, pipeline steps.
//!
//! # Invariants
//! - `SnapshotMetadata` is the single record shape written to both the
//!   registry document and each snapshot's `metadata.json`.
//! - An unverified snapshot is flagged in every human-facing rendering.

mod types;

pub use types::{
    CompressionFormat, ParseCompressionFormatError, SnapshotId, SnapshotMetadata, Step,
    archive_file_name, sanitize_repo_name,
};
