use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tar::EntryType;

use crate::git::{VcsError, VersionControl};

/// Shape of a tar archive: how many non-directory entries it holds and which
/// names sit at its top level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub file_count: u64,
    pub top_level: BTreeSet<String>,
}

impl ArchiveSummary {
    /// Walk an uncompressed tar stream without unpacking it.
    pub fn scan(reader: impl Read) -> std::io::Result<Self> {
        let mut summary = Self::default();
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let entry = entry?;
            let kind = entry.header().entry_type();
            if is_metadata_entry(kind) {
                continue;
            }
            let path = entry.path()?;
            if let Some(name) = top_level_name(&path) {
                summary.top_level.insert(name);
            }
            if !kind.is_dir() {
                summary.file_count += 1;
            }
        }
        Ok(summary)
    }
}

/// Pax and GNU bookkeeping records carry no tree content.
pub fn is_metadata_entry(kind: EntryType) -> bool {
    kind.is_pax_global_extensions()
        || kind.is_pax_local_extensions()
        || kind.is_gnu_longname()
        || kind.is_gnu_longlink()
}

/// First normal component of an archive path.
pub fn top_level_name(path: &Path) -> Option<String> {
    path.components().find_map(|c| match c {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Result of a clean capture.
#[derive(Debug, Clone)]
pub struct CleanCapture {
    pub archive_path: PathBuf,
    pub commit: String,
    pub branch: String,
    pub summary: ArchiveSummary,
}

/// Exports the committed tree of a repository as a tar archive.
pub struct ArchiveCapturer<'a, V: VersionControl> {
    vcs: &'a V,
}

impl<'a, V: VersionControl> ArchiveCapturer<'a, V> {
    pub fn new(vcs: &'a V) -> Self {
        Self { vcs }
    }

    /// Fail fast when `repo` has no version-control metadata.
    pub fn preflight(&self, repo: &Path) -> Result<(), VcsError> {
        if !repo.is_dir() || !self.vcs.is_repository(repo) {
            return Err(VcsError::NotARepository(repo.to_path_buf()));
        }
        Ok(())
    }

    /// Export the content tracked at `HEAD` into `dest`.
    ///
    /// `HEAD` is resolved to a commit id first and the export uses that id,
    /// so the archive and the recorded commit always agree.
    pub fn capture(&self, repo: &Path, dest: &Path) -> Result<CleanCapture, VcsError> {
        let commit = self.vcs.head_commit(repo)?;
        let branch = self.vcs.current_branch(repo)?;
        self.vcs.export_tracked(repo, &commit, dest)?;

        let file = std::fs::File::open(dest).map_err(|e| VcsError::io(dest, e))?;
        let summary = ArchiveSummary::scan(std::io::BufReader::new(file))
            .map_err(|e| VcsError::io(dest, e))?;

        tracing::debug!(
            %commit,
            %branch,
            files = summary.file_count,
            archive = %dest.display(),
            "clean capture written"
        );

        Ok(CleanCapture {
            archive_path: dest.to_path_buf(),
            commit,
            branch,
            summary,
        })
    }
}
