//! Reading stored archives back: hashing, extraction, directory overlay.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use repovault_vcs::{DIRTY_STATE_DIR, is_collectable, is_metadata_entry, top_level_name};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::store::DELETIONS_FILE;

/// The files of one stored snapshot that its verification hash covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub archive: PathBuf,
    pub dirty_state: PathBuf,
    pub deletions: PathBuf,
}

impl StoredPayload {
    /// Payload layout inside snapshot directory `dir`.
    pub fn in_dir(dir: &Path, archive_file: &str) -> Self {
        Self {
            archive: dir.join(archive_file),
            dirty_state: dir.join(DIRTY_STATE_DIR),
            deletions: dir.join(DELETIONS_FILE),
        }
    }
}

/// What an extraction produced.
#[derive(Debug, Clone, Default)]
pub struct ExtractReport {
    pub files: u64,
    pub top_level: BTreeSet<String>,
    /// Entries that could not be written; extraction carried on without them.
    pub warnings: Vec<String>,
}

/// Unpack an uncompressed tar stream into `dest`, overwriting existing files.
///
/// Per-entry failures become warnings. A broken stream (truncation, bad
/// header) is an error: nothing after it can be trusted.
pub fn unpack(reader: impl Read, dest: &Path) -> std::io::Result<ExtractReport> {
    let mut report = ExtractReport::default();
    let mut archive = tar::Archive::new(reader);
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if is_metadata_entry(kind) {
            continue;
        }
        let path = entry.path()?.into_owned();
        match entry.unpack_in(dest) {
            Ok(true) => {
                if let Some(name) = top_level_name(&path) {
                    report.top_level.insert(name);
                }
                if !kind.is_dir() {
                    report.files += 1;
                }
            }
            Ok(false) => report
                .warnings
                .push(format!("{}: path escapes the target directory", path.display())),
            Err(e) => report.warnings.push(format!("{}: {e}", path.display())),
        }
    }
    Ok(report)
}

/// `sha256:<hex>` over the whole payload: the archive bytes, then every
/// dirty-state entry in path order (kind, relative path, content), then the
/// deletion list. Absent dirty state and deletion list hash as empty.
pub fn hash_payload(payload: &StoredPayload) -> std::io::Result<String> {
    let mut hasher = Sha256::new();

    hasher.update(b"archive\0");
    hash_reader(&mut hasher, std::fs::File::open(&payload.archive)?)?;

    if payload.dirty_state.is_dir() {
        for entry in WalkDir::new(&payload.dirty_state)
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(std::io::Error::other)?;
            let rel = entry
                .path()
                .strip_prefix(&payload.dirty_state)
                .map_err(std::io::Error::other)?;
            let file_type = entry.file_type();
            let tag: &[u8] = if file_type.is_dir() {
                b"dir\0"
            } else if file_type.is_symlink() {
                b"link\0"
            } else {
                b"file\0"
            };
            hasher.update(tag);
            hasher.update(rel.as_os_str().as_encoded_bytes());
            hasher.update([0u8]);

            if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                hasher.update(target.as_os_str().as_encoded_bytes());
                hasher.update([0u8]);
            } else if file_type.is_file() {
                let len = entry.metadata().map_err(std::io::Error::other)?.len();
                hasher.update(len.to_le_bytes());
                hash_reader(&mut hasher, std::fs::File::open(entry.path())?)?;
            }
        }
    }

    match std::fs::read(&payload.deletions) {
        Ok(bytes) => {
            hasher.update(b"deleted\0");
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    Ok(format!("sha256:{:x}", hasher.finalize()))
}

fn hash_reader(hasher: &mut Sha256, mut reader: impl Read) -> std::io::Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}

/// Copy every file under `src` onto `dest`, replacing files at the same
/// relative path. Returns the number of files written.
pub fn overlay_tree(src: &Path, dest: &Path) -> std::io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            // A committed file may have been replaced by a directory.
            if let Ok(existing) = std::fs::symlink_metadata(&target) {
                if !existing.is_dir() {
                    std::fs::remove_file(&target)?;
                }
            }
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Ok(existing) = std::fs::symlink_metadata(&target) {
            if existing.is_dir() {
                std::fs::remove_dir_all(&target)?;
            } else {
                std::fs::remove_file(&target)?;
            }
        }
        if file_type.is_symlink() {
            copy_link(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
        copied += 1;
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_link(src: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(std::fs::read_link(src)?, target)
}

#[cfg(not(unix))]
fn copy_link(src: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::copy(src, target).map(|_| ())
}

/// Remove the files at `paths` (relative to `dest`). Directories, absent
/// paths and paths that would leave `dest` are left alone. Returns the
/// number of files removed.
pub fn remove_paths(dest: &Path, paths: &[PathBuf]) -> std::io::Result<u64> {
    let mut removed = 0;
    for rel in paths {
        if !is_collectable(rel) {
            tracing::warn!(path = %rel.display(), "ignoring unsafe deletion entry");
            continue;
        }
        let target = dest.join(rel);
        match std::fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => {
                tracing::debug!(path = %rel.display(), "deleted path is now a directory");
            }
            Ok(_) => {
                std::fs::remove_file(&target)?;
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Number of non-directory entries below `dir`; zero when it does not exist.
pub fn count_files(dir: &Path) -> std::io::Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_dir() {
            count += 1;
        }
    }
    Ok(count)
}

/// Total size in bytes of the files below `dir`, symlinks not followed.
pub fn tree_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(std::io::Error::other)?.len();
        }
    }
    Ok(total)
}

/// True when `dir` is missing or has no entries.
pub fn is_empty_dir(dir: &Path) -> std::io::Result<bool> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}
