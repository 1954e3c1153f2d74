//! Integrity verification: content hash plus optional trial extraction.

use std::collections::BTreeSet;
use std::io::BufReader;
use std::path::Path;

use crate::archive::{self, ExtractReport, StoredPayload};
use crate::codec::Compressor;

/// What a trial extraction must find to call the archive plausible.
#[derive(Debug, Clone, Default)]
pub struct ExpectedTree {
    /// Non-directory entries the archive should produce.
    pub files: u64,
    /// Top-level names that must exist after extraction. Empty when unknown.
    pub top_level: BTreeSet<String>,
}

/// Outcome of verifying a stored archive. Failure is a recorded state, not an
/// error: the snapshot is kept and flagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    /// Hash computed and, if requested, trial extraction succeeded.
    Passed { trial_extracted: bool },
    Failed { reason: String },
}

impl VerificationStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationStatus::Passed { .. })
    }
}

/// Hashes the stored archive and optionally proves it can be extracted.
pub struct Verifier<'a> {
    decompressor: &'a dyn Compressor,
    trial_extract: bool,
}

impl<'a> Verifier<'a> {
    pub fn new(decompressor: &'a dyn Compressor, trial_extract: bool) -> Self {
        Self {
            decompressor,
            trial_extract,
        }
    }

    /// Hash the whole payload and trial-extract its archive when enabled.
    ///
    /// Returns the hash (if it could be computed) alongside the status.
    pub fn verify(
        &self,
        payload: &StoredPayload,
        expected: &ExpectedTree,
    ) -> (Option<String>, VerificationStatus) {
        let hash = match archive::hash_payload(payload) {
            Ok(hash) => hash,
            Err(e) => {
                return (
                    None,
                    VerificationStatus::Failed {
                        reason: format!("hashing {} failed: {e}", payload.archive.display()),
                    },
                );
            }
        };

        if !self.trial_extract {
            return (
                Some(hash),
                VerificationStatus::Passed {
                    trial_extracted: false,
                },
            );
        }

        let status = match self.trial_extraction(&payload.archive, expected) {
            Ok(()) => VerificationStatus::Passed {
                trial_extracted: true,
            },
            Err(reason) => VerificationStatus::Failed { reason },
        };
        (Some(hash), status)
    }

    /// Extract into a scratch directory that is removed afterwards.
    pub fn trial_extraction(
        &self,
        archive_path: &Path,
        expected: &ExpectedTree,
    ) -> Result<(), String> {
        let _span =
            tracing::debug_span!("trial_extraction", archive = %archive_path.display()).entered();

        let scratch = tempfile::Builder::new()
            .prefix("repovault-verify-")
            .tempdir()
            .map_err(|e| format!("cannot create scratch directory: {e}"))?;

        let file = std::fs::File::open(archive_path)
            .map_err(|e| format!("cannot open {}: {e}", archive_path.display()))?;
        let reader = self
            .decompressor
            .decompress(Box::new(BufReader::new(file)))
            .map_err(|e| e.to_string())?;
        let report = archive::unpack(reader, scratch.path())
            .map_err(|e| format!("extraction aborted: {e}"))?;

        check_plausible(&report, expected)
    }
}

/// Extraction must be complete and contain what capture recorded.
fn check_plausible(report: &ExtractReport, expected: &ExpectedTree) -> Result<(), String> {
    if let Some(first) = report.warnings.first() {
        return Err(format!(
            "{} entries failed to extract (first: {first})",
            report.warnings.len()
        ));
    }
    if expected.files > 0 && report.files == 0 {
        return Err("extraction produced an empty tree".into());
    }
    if report.files != expected.files {
        return Err(format!(
            "extracted {} files, capture recorded {}",
            report.files, expected.files
        ));
    }
    let missing: Vec<_> = expected.top_level.difference(&report.top_level).collect();
    if !missing.is_empty() {
        return Err(format!("missing top-level entries: {missing:?}"));
    }
    Ok(())
}
