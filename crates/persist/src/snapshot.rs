use std::fmt::Display;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use repovault_common::{CompressionFormat, SnapshotId, SnapshotMetadata, Step, archive_file_name};
use repovault_vcs::{
    ArchiveCapturer, DIRTY_STATE_DIR, DirtyCollection, DirtyStateCollector, GitCli, VersionControl,
};

use crate::archive::{self, ExtractReport, StoredPayload};
use crate::codec::{Codec, CodecError, Compressor};
use crate::config::SnapshotConfig;
use crate::error::SnapshotError;
use crate::store::{
    DELETIONS_FILE, METADATA_FILE, Registry, RegistryError, read_deletions, write_json_atomic,
};
use crate::verify::{ExpectedTree, VerificationStatus, Verifier};

/// How a restore treats a target directory that already has content.
///
/// Restoring never diffs: existing files at archived paths are replaced and
/// unrelated files are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Refuse to restore into a non-empty directory.
    EmptyTargetOnly,
    /// Overwrite whatever is at the target.
    Overwrite,
}

/// What happened at the compression step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionStatus {
    Compressed { format: CompressionFormat, bytes: u64 },
    /// Configuration asked for uncompressed storage.
    Disabled,
    /// The compressor failed or was missing; the archive was kept as plain tar.
    FellBack { unavailable: bool, reason: String },
}

/// A successfully registered snapshot plus the reduced guarantees, if any,
/// it was created with.
#[derive(Debug, Clone)]
pub struct CreatedSnapshot {
    pub metadata: SnapshotMetadata,
    pub compression: CompressionStatus,
    pub verification: VerificationStatus,
    pub dirty: DirtyCollection,
}

/// Result of a completed restore.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub snapshot_id: SnapshotId,
    pub target: PathBuf,
    pub clean_files: u64,
    pub dirty_files: u64,
    /// Files removed because they were deleted in the captured working tree.
    pub deleted_files: u64,
    /// Entries that could not be written; the restore finished without them.
    pub warnings: Vec<String>,
    pub verified: bool,
}

/// Result of re-checking a stored snapshot.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub snapshot_id: SnapshotId,
    pub recorded_hash: Option<String>,
    pub actual_hash: Option<String>,
    pub status: VerificationStatus,
}

impl VerificationReport {
    pub fn hash_matches(&self) -> bool {
        matches!((&self.recorded_hash, &self.actual_hash), (Some(r), Some(a)) if r == a)
    }

    pub fn is_intact(&self) -> bool {
        self.hash_matches() && self.status.is_verified()
    }
}

/// Registry and disk out of step with each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    /// Directories under the root with no registry entry.
    pub orphan_dirs: Vec<PathBuf>,
    /// Registry entries whose directory is gone.
    pub dangling_entries: Vec<SnapshotId>,
}

impl OrphanReport {
    pub fn is_empty(&self) -> bool {
        self.orphan_dirs.is_empty() && self.dangling_entries.is_empty()
    }
}

/// Creates, restores and deletes repository snapshots.
///
/// Create runs `preflight → clean capture → dirty capture → compress → hash
/// → verify → register`. Nothing is registered unless every step before
/// `register` succeeded; a failed create removes its directory.
pub struct SnapshotManager<V: VersionControl = GitCli> {
    registry: Registry,
    vcs: V,
    compressor: Box<dyn Compressor>,
    verify_restore: bool,
}

impl SnapshotManager<GitCli> {
    /// Manager over the git CLI with the registry at `config.snapshot_root`.
    pub fn from_config(config: &SnapshotConfig) -> Result<Self, SnapshotError> {
        let registry = Registry::open(&config.snapshot_root)?;
        Ok(Self::new(registry, GitCli::new(), config))
    }
}

impl<V: VersionControl> SnapshotManager<V> {
    pub fn new(registry: Registry, vcs: V, config: &SnapshotConfig) -> Self {
        Self {
            registry,
            vcs,
            compressor: Box::new(config.codec()),
            verify_restore: config.verify_restore,
        }
    }

    /// Replace the configured compression backend.
    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Capture the committed tree and dirty state of `repo_path`.
    pub fn create_snapshot(
        &mut self,
        repo_path: &Path,
        repo_name: &str,
        reason: &str,
    ) -> Result<CreatedSnapshot, SnapshotError> {
        let created_at = Utc::now();
        let _span = tracing::info_span!("create_snapshot", repo = repo_name).entered();

        ArchiveCapturer::new(&self.vcs)
            .preflight(repo_path)
            .map_err(|_| SnapshotError::NotAVersionControlledTree {
                path: repo_path.to_path_buf(),
            })?;

        let snapshot_id = self.allocate_id(repo_name, created_at);
        let dir = self.registry.snapshot_dir(&snapshot_id);
        std::fs::create_dir_all(self.registry.root())
            .and_then(|_| std::fs::create_dir(&dir))
            .map_err(|e| capture_failed(&snapshot_id, Step::CleanCapture, e))?;

        let request = CaptureRequest {
            snapshot_id: &snapshot_id,
            dir: &dir,
            repo_path,
            repo_name,
            reason,
            created_at,
        };
        match self.run_capture(&request) {
            Ok(created) => {
                tracing::info!(
                    snapshot_id = %snapshot_id,
                    verified = created.metadata.verified,
                    compressed = created.metadata.compressed,
                    files = created.metadata.file_count,
                    "snapshot created"
                );
                Ok(created)
            }
            Err(e) => {
                tracing::error!(snapshot_id = %snapshot_id, error = %e, "snapshot create aborted");
                if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %cleanup,
                        "could not remove partial snapshot directory"
                    );
                }
                Err(e)
            }
        }
    }

    fn run_capture(&mut self, req: &CaptureRequest<'_>) -> Result<CreatedSnapshot, SnapshotError> {
        let id = req.snapshot_id;

        let raw_archive = req
            .dir
            .join(archive_file_name(req.repo_name, CompressionFormat::None));
        let clean = ArchiveCapturer::new(&self.vcs)
            .capture(req.repo_path, &raw_archive)
            .map_err(|e| capture_failed(id, Step::CleanCapture, e))?;

        let dirty = DirtyStateCollector::new(&self.vcs)
            .collect(req.repo_path, &clean.commit, &req.dir.join(DIRTY_STATE_DIR))
            .map_err(|e| capture_failed(id, Step::DirtyCapture, e))?;
        if !dirty.missing.is_empty() {
            write_json_atomic(&req.dir.join(DELETIONS_FILE), &dirty.missing)
                .map_err(|e| capture_failed(id, Step::DirtyCapture, e))?;
        }

        let (format, compression) = self.compress_archive(id, &raw_archive, req)?;
        let payload = StoredPayload::in_dir(req.dir, &archive_file_name(req.repo_name, format));

        let expected = ExpectedTree {
            files: clean.summary.file_count,
            top_level: clean.summary.top_level.clone(),
        };
        let (verification_hash, verification) = self.with_decompressor(format, |c| {
            Verifier::new(c, self.verify_restore).verify(&payload, &expected)
        });
        if let VerificationStatus::Failed { reason } = &verification {
            tracing::warn!(snapshot_id = %id, %reason, "verification failed, kept UNVERIFIED");
        }

        let size_bytes =
            archive::tree_size(req.dir).map_err(|e| capture_failed(id, Step::Hash, e))?;

        let metadata = SnapshotMetadata {
            snapshot_id: id.clone(),
            repo_name: req.repo_name.to_string(),
            repo_path: req.repo_path.to_path_buf(),
            created_at: req.created_at,
            git_commit: clean.commit,
            git_branch: clean.branch,
            reason: req.reason.to_string(),
            compressed: format != CompressionFormat::None,
            compression_format: format,
            size_bytes,
            file_count: clean.summary.file_count + dirty.copied.len() as u64,
            verified: verification.is_verified(),
            verification_hash,
        };

        write_json_atomic(&req.dir.join(METADATA_FILE), &metadata)
            .map_err(|e| capture_failed(id, Step::Register, e))?;
        self.registry
            .register(metadata.clone())
            .map_err(|e| capture_failed(id, Step::Register, e))?;

        Ok(CreatedSnapshot {
            metadata,
            compression,
            verification,
            dirty,
        })
    }

    /// Compress the raw tar in place. Any compressor failure falls back to
    /// keeping the raw tar.
    fn compress_archive(
        &self,
        id: &SnapshotId,
        raw_archive: &Path,
        req: &CaptureRequest<'_>,
    ) -> Result<(CompressionFormat, CompressionStatus), SnapshotError> {
        let format = self.compressor.format();
        if format == CompressionFormat::None {
            return Ok((CompressionFormat::None, CompressionStatus::Disabled));
        }

        let dest = req.dir.join(archive_file_name(req.repo_name, format));
        match self.compress_file(raw_archive, &dest) {
            Ok(bytes) => {
                std::fs::remove_file(raw_archive)
                    .map_err(|e| capture_failed(id, Step::Compress, e))?;
                Ok((format, CompressionStatus::Compressed { format, bytes }))
            }
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&dest) {
                    tracing::debug!(
                        path = %dest.display(),
                        error = %cleanup,
                        "could not remove partial compressed archive"
                    );
                }
                let unavailable = matches!(e, CodecError::Unavailable { .. });
                tracing::warn!(
                    snapshot_id = %id,
                    error = %e,
                    unavailable,
                    "compression skipped, storing uncompressed archive"
                );
                Ok((
                    CompressionFormat::None,
                    CompressionStatus::FellBack {
                        unavailable,
                        reason: e.to_string(),
                    },
                ))
            }
        }
    }

    fn compress_file(&self, src: &Path, dest: &Path) -> Result<u64, CodecError> {
        let backend = self.compressor.format().as_str();
        let io_failed = |source| CodecError::Failed { backend, source };

        let mut input = BufReader::new(std::fs::File::open(src).map_err(io_failed)?);
        let mut output = BufWriter::new(std::fs::File::create(dest).map_err(io_failed)?);
        let bytes = self.compressor.compress(&mut input, &mut output)?;
        output.flush().map_err(io_failed)?;
        Ok(bytes)
    }

    /// Run `f` with a compressor able to read `format`. The injected
    /// compressor is preferred when it handles that format.
    fn with_decompressor<T>(
        &self,
        format: CompressionFormat,
        f: impl FnOnce(&dyn Compressor) -> T,
    ) -> T {
        if self.compressor.format() == format {
            f(self.compressor.as_ref())
        } else {
            f(&Codec::for_format(format))
        }
    }

    fn allocate_id(&self, repo_name: &str, created_at: DateTime<Utc>) -> SnapshotId {
        let taken = |id: &SnapshotId| {
            self.registry.contains(id) || self.registry.snapshot_dir(id).exists()
        };
        let base = SnapshotId::derive(repo_name, created_at);
        if !taken(&base) {
            return base;
        }
        let mut n = 1;
        loop {
            let candidate = base.with_suffix(n);
            if !taken(&candidate) {
                tracing::debug!(%base, %candidate, "snapshot id already used this second");
                return candidate;
            }
            n += 1;
        }
    }

    /// Write snapshot `id` back into `target`: the clean capture first, then
    /// the dirty state on top of it, then the recorded deletions.
    ///
    /// This overwrites files in `target` without comparing them. With
    /// [`RestoreMode::EmptyTargetOnly`] a non-empty target is refused. If an
    /// error is returned, `target` may be partially written.
    pub fn restore_snapshot(
        &self,
        id: &SnapshotId,
        target: &Path,
        mode: RestoreMode,
    ) -> Result<RestoreReport, SnapshotError> {
        let _span = tracing::info_span!("restore_snapshot", snapshot_id = %id).entered();
        let meta = self.registry.get(id)?;
        if !meta.verified {
            tracing::warn!(snapshot_id = %id, "restoring an UNVERIFIED snapshot");
        }
        let failed = |step: Step, reason: &dyn Display| SnapshotError::RestoreFailed {
            snapshot_id: id.clone(),
            step,
            reason: reason.to_string(),
        };

        if mode == RestoreMode::EmptyTargetOnly {
            let empty = archive::is_empty_dir(target).map_err(|e| failed(Step::Preflight, &e))?;
            if !empty {
                return Err(failed(
                    Step::Preflight,
                    &format!(
                        "{} is not empty; use RestoreMode::Overwrite to replace its contents",
                        target.display()
                    ),
                ));
            }
        }

        let dir = self.registry.snapshot_dir(id);
        let payload = StoredPayload::in_dir(&dir, &meta.archive_file_name());
        let archive_path = &payload.archive;
        if !archive_path.is_file() {
            return Err(failed(
                Step::Lookup,
                &format!("archive {} is missing", archive_path.display()),
            ));
        }

        if let Some(recorded) = &meta.verification_hash {
            let actual = archive::hash_payload(&payload).map_err(|e| failed(Step::Hash, &e))?;
            if &actual != recorded {
                return Err(failed(
                    Step::Hash,
                    &format!("payload hash {actual} does not match recorded {recorded}"),
                ));
            }
        }
        let deletions =
            read_deletions(&payload.deletions).map_err(|e| failed(Step::Overlay, &e))?;

        std::fs::create_dir_all(target).map_err(|e| failed(Step::Extract, &e))?;
        tracing::warn!(target = %target.display(), "overwriting restore target");

        let file = std::fs::File::open(archive_path).map_err(|e| failed(Step::Decompress, &e))?;
        let report: ExtractReport = self.with_decompressor(meta.compression_format, |c| {
            let reader = c
                .decompress(Box::new(BufReader::new(file)))
                .map_err(|e| failed(Step::Decompress, &e))?;
            archive::unpack(reader, target).map_err(|e| failed(Step::Extract, &e))
        })?;
        for warning in &report.warnings {
            tracing::warn!(snapshot_id = %id, %warning, "entry not restored");
        }

        let dirty_files = if payload.dirty_state.is_dir() {
            archive::overlay_tree(&payload.dirty_state, target)
                .map_err(|e| failed(Step::Overlay, &e))?
        } else {
            0
        };
        let deleted_files =
            archive::remove_paths(target, &deletions).map_err(|e| failed(Step::Overlay, &e))?;

        tracing::info!(
            snapshot_id = %id,
            target = %target.display(),
            clean_files = report.files,
            dirty_files,
            deleted_files,
            warnings = report.warnings.len(),
            "snapshot restored"
        );
        Ok(RestoreReport {
            snapshot_id: id.clone(),
            target: target.to_path_buf(),
            clean_files: report.files,
            dirty_files,
            deleted_files,
            warnings: report.warnings,
            verified: meta.verified,
        })
    }

    /// All snapshots in creation order, optionally for one repository.
    pub fn list_snapshots(&self, repo_name: Option<&str>) -> Vec<&SnapshotMetadata> {
        let snapshots = self.registry.list(repo_name);
        let unverified = snapshots.iter().filter(|m| !m.verified).count();
        if unverified > 0 {
            tracing::warn!(unverified, "listing includes UNVERIFIED snapshots");
        }
        snapshots
    }

    pub fn get_snapshot_info(&self, id: &SnapshotId) -> Result<&SnapshotMetadata, SnapshotError> {
        let meta = self.registry.get(id)?;
        if !meta.verified {
            tracing::warn!(snapshot_id = %id, "snapshot is UNVERIFIED");
        }
        Ok(meta)
    }

    /// Remove the snapshot directory, then its registry entry.
    ///
    /// A registry entry whose directory is already gone is still removed.
    pub fn delete_snapshot(&mut self, id: &SnapshotId) -> Result<SnapshotMetadata, SnapshotError> {
        let _span = tracing::info_span!("delete_snapshot", snapshot_id = %id).entered();
        if !self.registry.contains(id) {
            return Err(SnapshotError::SnapshotNotFound(id.clone()));
        }

        let dir = self.registry.snapshot_dir(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!(dir = %dir.display(), "snapshot directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(dir = %dir.display(), "snapshot directory already gone");
            }
            Err(e) => {
                return Err(SnapshotError::DeleteFailed {
                    snapshot_id: id.clone(),
                    reason: format!("removing {}: {e}", dir.display()),
                });
            }
        }

        let removed = self.registry.remove(id).map_err(|e| match e {
            RegistryError::NotFound(id) => SnapshotError::SnapshotNotFound(id),
            other => SnapshotError::DeleteFailed {
                snapshot_id: id.clone(),
                reason: other.to_string(),
            },
        })?;
        tracing::info!(snapshot_id = %id, "snapshot deleted");
        Ok(removed)
    }

    /// Re-hash a stored snapshot and optionally trial-extract it. Read-only:
    /// the registry entry is not updated.
    pub fn verify_snapshot(
        &self,
        id: &SnapshotId,
        trial_extract: bool,
    ) -> Result<VerificationReport, SnapshotError> {
        let _span = tracing::info_span!("verify_snapshot", snapshot_id = %id).entered();
        let meta = self.registry.get(id)?;
        let dir = self.registry.snapshot_dir(id);
        let payload = StoredPayload::in_dir(&dir, &meta.archive_file_name());

        let (actual_hash, status) = match archive::count_files(&payload.dirty_state) {
            Ok(dirty_files) => {
                let expected = ExpectedTree {
                    files: meta.file_count.saturating_sub(dirty_files),
                    top_level: Default::default(),
                };
                self.with_decompressor(meta.compression_format, |c| {
                    Verifier::new(c, trial_extract).verify(&payload, &expected)
                })
            }
            Err(e) => (
                archive::hash_payload(&payload).ok(),
                VerificationStatus::Failed {
                    reason: format!("cannot read dirty state: {e}"),
                },
            ),
        };

        let report = VerificationReport {
            snapshot_id: id.clone(),
            recorded_hash: meta.verification_hash.clone(),
            actual_hash,
            status,
        };
        if report.is_intact() {
            tracing::info!(snapshot_id = %id, "snapshot intact");
        } else {
            tracing::warn!(
                snapshot_id = %id,
                hash_matches = report.hash_matches(),
                status = ?report.status,
                "snapshot failed verification"
            );
        }
        Ok(report)
    }

    /// Delete all but the newest `keep` snapshots of `repo_name`.
    pub fn prune_snapshots(
        &mut self,
        repo_name: &str,
        keep: usize,
    ) -> Result<Vec<SnapshotId>, SnapshotError> {
        let ids: Vec<SnapshotId> = self
            .registry
            .list(Some(repo_name))
            .iter()
            .map(|m| m.snapshot_id.clone())
            .collect();
        let excess = ids.len().saturating_sub(keep);

        let mut removed = Vec::with_capacity(excess);
        for id in ids.into_iter().take(excess) {
            self.delete_snapshot(&id)?;
            removed.push(id);
        }
        Ok(removed)
    }

    /// Compare the snapshot root against the registry.
    pub fn find_orphans(&self) -> Result<OrphanReport, SnapshotError> {
        let root = self.registry.root();
        let entries = std::fs::read_dir(root).map_err(|source| RegistryError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let mut report = OrphanReport::default();
        for entry in entries {
            let entry = entry.map_err(|source| RegistryError::Io {
                path: root.to_path_buf(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = SnapshotId::from(entry.file_name().to_string_lossy().into_owned());
            if !self.registry.contains(&id) {
                report.orphan_dirs.push(entry.path());
            }
        }
        report.orphan_dirs.sort();

        for meta in self.registry.list(None) {
            if !self.registry.snapshot_dir(&meta.snapshot_id).is_dir() {
                report.dangling_entries.push(meta.snapshot_id.clone());
            }
        }
        Ok(report)
    }
}

struct CaptureRequest<'a> {
    snapshot_id: &'a SnapshotId,
    dir: &'a Path,
    repo_path: &'a Path,
    repo_name: &'a str,
    reason: &'a str,
    created_at: DateTime<Utc>,
}

fn capture_failed(id: &SnapshotId, step: Step, e: impl Display) -> SnapshotError {
    SnapshotError::CaptureFailed {
        snapshot_id: id.clone(),
        step,
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::read_metadata;
    use repovault_vcs::VcsError;
    use std::io::{Read, Write};

    const COMMIT: &str = "c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00";

    /// In-process stand-in for git: exports a fixed file set.
    struct FakeVcs {
        files: Vec<(&'static str, &'static str)>,
        dirty: Vec<PathBuf>,
        fail_export: bool,
    }

    impl FakeVcs {
        fn new() -> Self {
            Self {
                files: vec![("a.txt", "hello"), ("src/lib.rs", "pub fn f() {}\n")],
                dirty: Vec::new(),
                fail_export: false,
            }
        }
    }

    impl VersionControl for FakeVcs {
        fn is_repository(&self, path: &Path) -> bool {
            path.join(".git").is_dir()
        }

        fn export_tracked(&self, _repo: &Path, rev: &str, dest: &Path) -> Result<(), VcsError> {
            assert_eq!(rev, COMMIT);
            let io = |source| VcsError::Io {
                path: dest.to_path_buf(),
                source,
            };
            if self.fail_export {
                return Err(VcsError::CommandFailed {
                    command: "git ls-tree".into(),
                    status: "exit status: 128".into(),
                    stderr: "fatal: simulated".into(),
                });
            }
            let mut builder = tar::Builder::new(std::fs::File::create(dest).map_err(io)?);
            for (name, body) in &self.files {
                let mut header = tar::Header::new_gnu();
                header.set_size(body.len() as u64);
                header.set_mode(0o644);
                builder
                    .append_data(&mut header, name, body.as_bytes())
                    .map_err(io)?;
            }
            builder.finish().map_err(io)
        }

        fn head_commit(&self, _repo: &Path) -> Result<String, VcsError> {
            Ok(COMMIT.into())
        }

        fn current_branch(&self, _repo: &Path) -> Result<String, VcsError> {
            Ok("main".into())
        }

        fn dirty_files(&self, _repo: &Path, _rev: &str) -> Result<Vec<PathBuf>, VcsError> {
            Ok(self.dirty.clone())
        }
    }

    struct UnavailableCompressor;

    impl Compressor for UnavailableCompressor {
        fn format(&self) -> CompressionFormat {
            CompressionFormat::Zstd
        }

        fn compress(&self, _: &mut dyn Read, _: &mut dyn Write) -> Result<u64, CodecError> {
            Err(CodecError::Unavailable {
                backend: "zstd",
                reason: "simulated missing backend".into(),
            })
        }

        fn decompress<'a>(
            &self,
            _: Box<dyn Read + 'a>,
        ) -> Result<Box<dyn Read + 'a>, CodecError> {
            Err(CodecError::Unavailable {
                backend: "zstd",
                reason: "simulated missing backend".into(),
            })
        }
    }

    /// Claims zstd but stores only the first half of the raw tar.
    struct TruncatingCompressor;

    impl Compressor for TruncatingCompressor {
        fn format(&self) -> CompressionFormat {
            CompressionFormat::Zstd
        }

        fn compress(
            &self,
            input: &mut dyn Read,
            output: &mut dyn Write,
        ) -> Result<u64, CodecError> {
            let failed = |source| CodecError::Failed {
                backend: "zstd",
                source,
            };
            let mut raw = Vec::new();
            input.read_to_end(&mut raw).map_err(failed)?;
            let half = &raw[..raw.len() / 2];
            output.write_all(half).map_err(failed)?;
            Ok(half.len() as u64)
        }

        fn decompress<'a>(
            &self,
            input: Box<dyn Read + 'a>,
        ) -> Result<Box<dyn Read + 'a>, CodecError> {
            Ok(input)
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        repo: PathBuf,
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let repo = tmp.path().join("repo");
            std::fs::create_dir_all(repo.join(".git")).unwrap();
            let root = tmp.path().join("snapshots");
            Self {
                _tmp: tmp,
                repo,
                root,
            }
        }

        fn manager(&self, vcs: FakeVcs, config: SnapshotConfig) -> SnapshotManager<FakeVcs> {
            let config = SnapshotConfig {
                snapshot_root: self.root.clone(),
                ..config
            };
            SnapshotManager::new(Registry::open(&self.root).unwrap(), vcs, &config)
        }

        fn target(&self, name: &str) -> PathBuf {
            self._tmp.path().join(name)
        }
    }

    #[test]
    fn create_registers_entry_and_mirrors_metadata() {
        let fx = Fixture::new();
        std::fs::write(fx.repo.join("b.txt"), "world").unwrap();
        let mut vcs = FakeVcs::new();
        vcs.dirty = vec![PathBuf::from("b.txt")];
        let mut manager = fx.manager(vcs, SnapshotConfig::default());

        let created = manager
            .create_snapshot(&fx.repo, "demo", "before refactor")
            .unwrap();
        let meta = &created.metadata;
        assert_eq!(meta.git_commit, COMMIT);
        assert_eq!(meta.git_branch, "main");
        assert_eq!(meta.file_count, 3);
        assert!(meta.verified);
        assert!(meta.verification_hash.as_deref().unwrap().starts_with("sha256:"));
        assert_eq!(created.verification, VerificationStatus::Passed { trial_extracted: true });

        let dir = fx.root.join(meta.snapshot_id.as_str());
        assert_eq!(read_metadata(&dir.join(METADATA_FILE)).unwrap(), *meta);
        assert_eq!(manager.get_snapshot_info(&meta.snapshot_id).unwrap(), meta);
        assert_eq!(
            std::fs::read_to_string(dir.join(DIRTY_STATE_DIR).join("b.txt")).unwrap(),
            "world"
        );
        assert!(dir.join(meta.archive_file_name()).is_file());
    }

    #[test]
    fn not_a_repository_has_no_side_effects() {
        let fx = Fixture::new();
        std::fs::remove_dir_all(fx.repo.join(".git")).unwrap();
        let mut manager = fx.manager(FakeVcs::new(), SnapshotConfig::default());

        let err = manager.create_snapshot(&fx.repo, "demo", "x").unwrap_err();
        assert!(matches!(err, SnapshotError::NotAVersionControlledTree { .. }));
        assert_eq!(err.step(), Some(Step::Preflight));
        assert!(manager.list_snapshots(None).is_empty());
        assert_eq!(std::fs::read_dir(&fx.root).unwrap().count(), 0);
    }

    #[test]
    fn failed_capture_cleans_up_and_registers_nothing() {
        let fx = Fixture::new();
        let mut vcs = FakeVcs::new();
        vcs.fail_export = true;
        let mut manager = fx.manager(vcs, SnapshotConfig::default());

        let err = manager.create_snapshot(&fx.repo, "demo", "x").unwrap_err();
        match &err {
            SnapshotError::CaptureFailed { step, .. } => assert_eq!(*step, Step::CleanCapture),
            other => panic!("expected CaptureFailed, got {other:?}"),
        }
        assert!(err.snapshot_id().unwrap().as_str().starts_with("demo_"));
        assert!(manager.list_snapshots(None).is_empty());
        assert_eq!(std::fs::read_dir(&fx.root).unwrap().count(), 0);
    }

    #[test]
    fn unavailable_compressor_falls_back_to_plain_tar() {
        let fx = Fixture::new();
        let mut manager = fx
            .manager(FakeVcs::new(), SnapshotConfig::default())
            .with_compressor(Box::new(UnavailableCompressor));

        let created = manager.create_snapshot(&fx.repo, "demo", "x").unwrap();
        let meta = &created.metadata;
        assert!(!meta.compressed);
        assert_eq!(meta.compression_format, CompressionFormat::None);
        assert!(meta.verified);
        assert!(matches!(
            created.compression,
            CompressionStatus::FellBack {
                unavailable: true,
                ..
            }
        ));

        let archive = fx.root.join(meta.snapshot_id.as_str()).join("demo.tar");
        let mut names = Vec::new();
        for entry in tar::Archive::new(std::fs::File::open(archive).unwrap())
            .entries()
            .unwrap()
        {
            names.push(entry.unwrap().path().unwrap().display().to_string());
        }
        assert_eq!(names, ["a.txt", "src/lib.rs"]);
    }

    #[test]
    fn truncated_archive_is_kept_unverified() {
        let fx = Fixture::new();
        let mut manager = fx
            .manager(FakeVcs::new(), SnapshotConfig::default())
            .with_compressor(Box::new(TruncatingCompressor));

        let created = manager.create_snapshot(&fx.repo, "demo", "x").unwrap();
        assert!(!created.metadata.verified);
        assert!(created.metadata.verification_hash.is_some());
        assert!(matches!(created.verification, VerificationStatus::Failed { .. }));

        let id = &created.metadata.snapshot_id;
        assert!(fx.root.join(id.as_str()).is_dir());
        assert_eq!(manager.list_snapshots(None).len(), 1);
        assert!(manager.list_snapshots(None)[0].to_string().contains("UNVERIFIED"));
    }

    #[test]
    fn verification_disabled_still_hashes() {
        let fx = Fixture::new();
        let config = SnapshotConfig {
            verify_restore: false,
            ..SnapshotConfig::default()
        };
        let mut manager = fx
            .manager(FakeVcs::new(), config)
            .with_compressor(Box::new(TruncatingCompressor));

        let created = manager.create_snapshot(&fx.repo, "demo", "x").unwrap();
        assert!(created.metadata.verified);
        assert_eq!(
            created.verification,
            VerificationStatus::Passed {
                trial_extracted: false
            }
        );
    }

    #[test]
    fn unknown_id_is_not_found_and_registry_untouched() {
        let fx = Fixture::new();
        let mut manager = fx.manager(FakeVcs::new(), SnapshotConfig::default());
        manager.create_snapshot(&fx.repo, "demo", "x").unwrap();
        let before = std::fs::read(fx.root.join(crate::store::REGISTRY_FILE)).unwrap();

        let missing = SnapshotId::from("nonexistent");
        assert!(matches!(
            manager.get_snapshot_info(&missing),
            Err(SnapshotError::SnapshotNotFound(_))
        ));
        assert!(matches!(
            manager.restore_snapshot(&missing, &fx.target("out"), RestoreMode::Overwrite),
            Err(SnapshotError::SnapshotNotFound(_))
        ));
        assert!(matches!(
            manager.delete_snapshot(&missing),
            Err(SnapshotError::SnapshotNotFound(_))
        ));
        let after = std::fs::read(fx.root.join(crate::store::REGISTRY_FILE)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn delete_twice_reports_not_found_the_second_time() {
        let fx = Fixture::new();
        let mut manager = fx.manager(FakeVcs::new(), SnapshotConfig::default());
        let id = manager
            .create_snapshot(&fx.repo, "demo", "x")
            .unwrap()
            .metadata
            .snapshot_id;

        manager.delete_snapshot(&id).unwrap();
        assert!(!fx.root.join(id.as_str()).exists());
        assert!(matches!(
            manager.delete_snapshot(&id),
            Err(SnapshotError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn delete_heals_entry_whose_directory_vanished() {
        let fx = Fixture::new();
        let mut manager = fx.manager(FakeVcs::new(), SnapshotConfig::default());
        let id = manager
            .create_snapshot(&fx.repo, "demo", "x")
            .unwrap()
            .metadata
            .snapshot_id;
        std::fs::remove_dir_all(fx.root.join(id.as_str())).unwrap();

        assert_eq!(manager.find_orphans().unwrap().dangling_entries, vec![id.clone()]);
        manager.delete_snapshot(&id).unwrap();
        assert!(manager.list_snapshots(None).is_empty());
    }

    #[test]
    fn restore_refuses_non_empty_target_unless_overwriting() {
        let fx = Fixture::new();
        let mut manager = fx.manager(FakeVcs::new(), SnapshotConfig::default());
        let id = manager
            .create_snapshot(&fx.repo, "demo", "x")
            .unwrap()
            .metadata
            .snapshot_id;

        let target = fx.target("out");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("a.txt"), "stale").unwrap();
        std::fs::write(target.join("keep.txt"), "unrelated").unwrap();

        let err = manager
            .restore_snapshot(&id, &target, RestoreMode::EmptyTargetOnly)
            .unwrap_err();
        assert_eq!(err.step(), Some(Step::Preflight));
        assert_eq!(std::fs::read_to_string(target.join("a.txt")).unwrap(), "stale");

        let report = manager
            .restore_snapshot(&id, &target, RestoreMode::Overwrite)
            .unwrap();
        assert_eq!(report.clean_files, 2);
        assert_eq!(std::fs::read_to_string(target.join("a.txt")).unwrap(), "hello");
        assert_eq!(std::fs::read_to_string(target.join("keep.txt")).unwrap(), "unrelated");
    }

    #[test]
    fn restore_rejects_archive_corrupted_after_creation() {
        let fx = Fixture::new();
        let mut manager = fx.manager(FakeVcs::new(), SnapshotConfig::default());
        let meta = manager.create_snapshot(&fx.repo, "demo", "x").unwrap().metadata;

        let archive = fx
            .root
            .join(meta.snapshot_id.as_str())
            .join(meta.archive_file_name());
        let mut data = std::fs::read(&archive).unwrap();
        if let Some(byte) = data.last_mut() {
            *byte ^= 0xff;
        }
        std::fs::write(&archive, &data).unwrap();

        let report = manager.verify_snapshot(&meta.snapshot_id, false).unwrap();
        assert!(!report.hash_matches());

        let err = manager
            .restore_snapshot(&meta.snapshot_id, &fx.target("out"), RestoreMode::EmptyTargetOnly)
            .unwrap_err();
        assert_eq!(err.step(), Some(Step::Hash));
        assert_eq!(err.snapshot_id(), Some(&meta.snapshot_id));
    }

    #[test]
    fn verify_snapshot_reports_intact_archive() {
        let fx = Fixture::new();
        std::fs::write(fx.repo.join("b.txt"), "world").unwrap();
        let mut vcs = FakeVcs::new();
        vcs.dirty = vec![PathBuf::from("b.txt")];
        let mut manager = fx.manager(vcs, SnapshotConfig::default());
        let id = manager
            .create_snapshot(&fx.repo, "demo", "x")
            .unwrap()
            .metadata
            .snapshot_id;

        let report = manager.verify_snapshot(&id, true).unwrap();
        assert!(report.is_intact(), "{report:?}");
    }

    #[test]
    fn ids_within_one_second_get_suffixes() {
        let fx = Fixture::new();
        let manager = fx.manager(FakeVcs::new(), SnapshotConfig::default());
        let at = Utc::now();
        let base = SnapshotId::derive("demo", at);
        std::fs::create_dir_all(fx.root.join(base.as_str())).unwrap();

        assert_eq!(manager.allocate_id("demo", at), base.with_suffix(1));
    }

    #[test]
    fn prune_keeps_newest_and_orphans_are_found() {
        let fx = Fixture::new();
        let mut manager = fx.manager(FakeVcs::new(), SnapshotConfig::default());
        let ids: Vec<_> = (0..3)
            .map(|_| {
                manager
                    .create_snapshot(&fx.repo, "demo", "x")
                    .unwrap()
                    .metadata
                    .snapshot_id
            })
            .collect();

        let removed = manager.prune_snapshots("demo", 1).unwrap();
        assert_eq!(removed, ids[..2]);
        let left: Vec<_> = manager
            .list_snapshots(Some("demo"))
            .iter()
            .map(|m| m.snapshot_id.clone())
            .collect();
        assert_eq!(left, ids[2..]);

        let stray = fx.root.join("demo_19700101_000000");
        std::fs::create_dir_all(&stray).unwrap();
        let orphans = manager.find_orphans().unwrap();
        assert_eq!(orphans.orphan_dirs, vec![stray]);
        assert!(orphans.dangling_entries.is_empty());
    }

    #[test]
    fn deleted_tracked_file_stays_deleted_after_restore() {
        let fx = Fixture::new();
        let mut vcs = FakeVcs::new();
        vcs.dirty = vec![PathBuf::from("a.txt")];
        let mut manager = fx.manager(vcs, SnapshotConfig::default());

        let created = manager.create_snapshot(&fx.repo, "demo", "x").unwrap();
        assert_eq!(created.dirty.missing, vec![PathBuf::from("a.txt")]);
        let dir = fx.root.join(created.metadata.snapshot_id.as_str());
        assert_eq!(
            read_deletions(&dir.join(DELETIONS_FILE)).unwrap(),
            vec![PathBuf::from("a.txt")]
        );

        let target = fx.target("out");
        let report = manager
            .restore_snapshot(&created.metadata.snapshot_id, &target, RestoreMode::EmptyTargetOnly)
            .unwrap();
        assert_eq!(report.deleted_files, 1);
        assert!(!target.join("a.txt").exists());
        assert!(target.join("src/lib.rs").is_file());
    }

    #[test]
    fn tampered_dirty_state_fails_verify_and_restore() {
        let fx = Fixture::new();
        std::fs::write(fx.repo.join("b.txt"), "world").unwrap();
        let mut vcs = FakeVcs::new();
        vcs.dirty = vec![PathBuf::from("b.txt")];
        let mut manager = fx.manager(vcs, SnapshotConfig::default());
        let id = manager
            .create_snapshot(&fx.repo, "demo", "x")
            .unwrap()
            .metadata
            .snapshot_id;

        let copy = fx.root.join(id.as_str()).join(DIRTY_STATE_DIR).join("b.txt");
        std::fs::write(&copy, "CORRUPT").unwrap();

        let report = manager.verify_snapshot(&id, true).unwrap();
        assert!(!report.hash_matches());
        assert!(!report.is_intact());

        let target = fx.target("out");
        let err = manager
            .restore_snapshot(&id, &target, RestoreMode::EmptyTargetOnly)
            .unwrap_err();
        assert_eq!(err.step(), Some(Step::Hash));
        assert!(!target.join("b.txt").exists());
    }

    #[test]
    fn tampered_deletion_list_fails_verify() {
        let fx = Fixture::new();
        let mut vcs = FakeVcs::new();
        vcs.dirty = vec![PathBuf::from("a.txt")];
        let mut manager = fx.manager(vcs, SnapshotConfig::default());
        let id = manager
            .create_snapshot(&fx.repo, "demo", "x")
            .unwrap()
            .metadata
            .snapshot_id;

        let list = fx.root.join(id.as_str()).join(DELETIONS_FILE);
        std::fs::write(&list, r#"["src/lib.rs"]"#).unwrap();
        assert!(!manager.verify_snapshot(&id, false).unwrap().hash_matches());
    }
}
