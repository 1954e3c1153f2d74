use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Unique identifier of a snapshot: `<repo_name>_<YYYYMMDD>_<HHMMSS>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Derive the id for a capture of `repo_name` started at `created_at`.
    pub fn derive(repo_name: &str, created_at: DateTime<Utc>) -> Self {
        Self(format!(
            "{}_{}",
            sanitize_repo_name(repo_name),
            created_at.format("%Y%m%d_%H%M%S")
        ))
    }

    /// Same id with a numeric disambiguator, used when two captures of one
    /// repository land in the same second.
    pub fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}_{n}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SnapshotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Compression applied to the stored clean capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    #[default]
    Zstd,
    None,
}

impl CompressionFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionFormat::Zstd => "zstd",
            CompressionFormat::None => "none",
        }
    }

    /// File-name suffix appended after `.tar`.
    pub fn extension(self) -> &'static str {
        match self {
            CompressionFormat::Zstd => ".zst",
            CompressionFormat::None => "",
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown compression format {0:?} (expected \"zstd\" or \"none\")")]
pub struct ParseCompressionFormatError(String);

impl FromStr for CompressionFormat {
    type Err = ParseCompressionFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zstd" => Ok(CompressionFormat::Zstd),
            "none" => Ok(CompressionFormat::None),
            other => Err(ParseCompressionFormatError(other.to_string())),
        }
    }
}

/// Metadata record for one snapshot.
///
/// Written to `snapshot_registry.json` and mirrored into the snapshot's own
/// `metadata.json`. Only the verification fields change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: SnapshotId,
    pub repo_name: String,
    /// Advisory only; not re-validated on restore.
    pub repo_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub git_commit: String,
    pub git_branch: String,
    pub reason: String,
    pub compressed: bool,
    pub compression_format: CompressionFormat,
    pub size_bytes: u64,
    pub file_count: u64,
    pub verified: bool,
    /// `sha256:<hex>` of the stored archive, when hashing succeeded.
    pub verification_hash: Option<String>,
}

impl SnapshotMetadata {
    /// Name of the clean-capture archive inside the snapshot directory.
    pub fn archive_file_name(&self) -> String {
        archive_file_name(&self.repo_name, self.compression_format)
    }

    /// Short form of the commit id for display.
    pub fn short_commit(&self) -> &str {
        let end = self
            .git_commit
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.git_commit.len());
        &self.git_commit[..end]
    }
}

impl fmt::Display for SnapshotMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = if self.verified { "verified" } else { "UNVERIFIED" };
        write!(
            f,
            "{} [{}] {}@{} ({}) {} files, {} bytes, {} - {}",
            self.snapshot_id,
            flag,
            self.repo_name,
            self.git_branch,
            self.short_commit(),
            self.file_count,
            self.size_bytes,
            self.compression_format,
            self.reason
        )
    }
}

/// Archive file name for a repository stored with `format`.
pub fn archive_file_name(repo_name: &str, format: CompressionFormat) -> String {
    format!("{}.tar{}", sanitize_repo_name(repo_name), format.extension())
}

/// Map a repository name onto something safe to use as a path component.
pub fn sanitize_repo_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "repo".to_string()
    } else {
        cleaned
    }
}

/// Stages of the create and restore pipelines, used to pinpoint failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Preflight,
    CleanCapture,
    DirtyCapture,
    Compress,
    Hash,
    Verify,
    Register,
    Lookup,
    Decompress,
    Extract,
    Overlay,
    Delete,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Preflight => "preflight_check",
            Step::CleanCapture => "clean_capture",
            Step::DirtyCapture => "dirty_capture",
            Step::Compress => "compress",
            Step::Hash => "hash",
            Step::Verify => "verify",
            Step::Register => "register",
            Step::Lookup => "lookup",
            Step::Decompress => "decompress",
            Step::Extract => "extract",
            Step::Overlay => "overlay",
            Step::Delete => "delete",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
