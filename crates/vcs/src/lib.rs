//! Version-control side of a snapshot: the clean export of committed content
//! and the side copy of everything the export does not cover.
//!
//! # Invariants
//! - The pre-flight repository check runs before anything touches disk.
//! - The clean capture never reads the working tree; it exports the objects
//!   of `rev` only, byte for byte, ignoring export attributes.
//! - Version-control internals are never collected as dirty state.

mod capture;
mod dirty;
mod git;

pub use capture::{ArchiveCapturer, ArchiveSummary, CleanCapture, is_metadata_entry, top_level_name};
pub use dirty::{DIRTY_STATE_DIR, DirtyCollection, DirtyStateCollector, is_collectable};
pub use git::{GitCli, VcsError, VersionControl};
