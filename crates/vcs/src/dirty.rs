use std::path::{Component, Path, PathBuf};

use crate::git::{VcsError, VersionControl};

/// Directory inside a snapshot that mirrors dirty working-tree files.
pub const DIRTY_STATE_DIR: &str = "dirty_state";

/// What the collector did with each dirty path.
#[derive(Debug, Clone, Default)]
pub struct DirtyCollection {
    /// Files (and symlinks) copied into the dirty-state directory.
    pub copied: Vec<PathBuf>,
    /// Tracked files no longer present in the working tree, either deleted
    /// or replaced by a directory. A restore removes them again.
    pub missing: Vec<PathBuf>,
    /// Paths that could not be represented (nested repositories, special files,
    /// unsafe paths).
    pub skipped: Vec<PathBuf>,
    pub bytes: u64,
}

impl DirtyCollection {
    pub fn is_clean(&self) -> bool {
        self.copied.is_empty() && self.missing.is_empty() && self.skipped.is_empty()
    }
}

/// Copies modified and untracked files next to the clean capture.
pub struct DirtyStateCollector<'a, V: VersionControl> {
    vcs: &'a V,
}

impl<'a, V: VersionControl> DirtyStateCollector<'a, V> {
    pub fn new(vcs: &'a V) -> Self {
        Self { vcs }
    }

    /// Copy every path that differs from `rev` into `dest`, preserving the
    /// repository-relative layout. `dest` is only created when there is
    /// something to copy.
    pub fn collect(
        &self,
        repo: &Path,
        rev: &str,
        dest: &Path,
    ) -> Result<DirtyCollection, VcsError> {
        let mut collection = DirtyCollection::default();

        for rel in self.vcs.dirty_files(repo, rev)? {
            if !is_collectable(&rel) {
                tracing::warn!(path = %rel.display(), "refusing to collect path");
                collection.skipped.push(rel);
                continue;
            }

            let src = repo.join(&rel);
            let meta = match std::fs::symlink_metadata(&src) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(path = %rel.display(), "tracked file deleted in working tree");
                    collection.missing.push(rel);
                    continue;
                }
                Err(e) => return Err(VcsError::io(src, e)),
            };

            if meta.is_dir() {
                if src.join(".git").exists() {
                    tracing::warn!(path = %rel.display(), "skipping nested repository");
                    collection.skipped.push(rel);
                } else {
                    // Files inside it show up as untracked paths of their own.
                    tracing::debug!(path = %rel.display(), "tracked file replaced by a directory");
                    collection.missing.push(rel);
                }
                continue;
            }

            let target = dest.join(&rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| VcsError::io(parent, e))?;
            }

            let file_type = meta.file_type();
            if file_type.is_file() {
                collection.bytes +=
                    std::fs::copy(&src, &target).map_err(|e| VcsError::io(&src, e))?;
                collection.copied.push(rel);
            } else if file_type.is_symlink() {
                if copy_symlink(&src, &target)? {
                    collection.copied.push(rel);
                } else {
                    tracing::warn!(path = %rel.display(), "symlink not supported on this platform");
                    collection.skipped.push(rel);
                }
            } else {
                tracing::warn!(path = %rel.display(), "skipping non-regular dirty path");
                collection.skipped.push(rel);
            }
        }

        if collection.is_clean() {
            tracing::debug!(repo = %repo.display(), "working tree clean");
        } else {
            tracing::info!(
                repo = %repo.display(),
                copied = collection.copied.len(),
                missing = collection.missing.len(),
                skipped = collection.skipped.len(),
                "working tree is dirty"
            );
        }
        Ok(collection)
    }
}

/// Relative, free of `..`, and outside the `.git` directory.
pub fn is_collectable(rel: &Path) -> bool {
    let mut components = rel.components().peekable();
    if components.peek().is_none() {
        return false;
    }
    components.all(|c| match c {
        Component::Normal(name) => name != ".git",
        Component::CurDir => true,
        _ => false,
    })
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> Result<bool, VcsError> {
    let link = std::fs::read_link(src).map_err(|e| VcsError::io(src, e))?;
    std::os::unix::fs::symlink(&link, target).map_err(|e| VcsError::io(target, e))?;
    Ok(true)
}

#[cfg(not(unix))]
fn copy_symlink(_src: &Path, _target: &Path) -> Result<bool, VcsError> {
    Ok(false)
}
