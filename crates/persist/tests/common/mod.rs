//! Throwaway git repositories for snapshot tests.

use std::path::{Path, PathBuf};
use std::process::Command;

use repovault_persist::{SnapshotConfig, SnapshotManager};
use tempfile::TempDir;

/// A git repository with one commit containing `a.txt` = `hello`.
pub struct TestRepo {
    _dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("work");
        std::fs::create_dir(&path).unwrap();

        git(&path, &["init"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&path, &["config", "user.email", "test@example.com"]);
        git(&path, &["config", "user.name", "Test User"]);
        git(&path, &["config", "commit.gpgsign", "false"]);

        std::fs::write(path.join("a.txt"), "hello").unwrap();
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "initial"]);

        Self { _dir: dir, path }
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let file = self.path.join(rel);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(file, contents).unwrap();
    }

    pub fn commit_all(&self, message: &str) {
        git(&self.path, &["add", "-A"]);
        git(&self.path, &["commit", "-m", message]);
    }

    /// Committed content of `rel` at `rev`.
    pub fn show(&self, rev: &str, rel: &str) -> String {
        git(&self.path, &["show", &format!("{rev}:{rel}")])
    }

    pub fn head(&self) -> String {
        git(&self.path, &["rev-parse", "HEAD"]).trim().to_string()
    }
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

/// Snapshot root and manager living in their own temp dir.
pub struct Vault {
    pub dir: TempDir,
    pub config: SnapshotConfig,
}

impl Vault {
    pub fn new() -> Self {
        Self::with(SnapshotConfig::default())
    }

    pub fn with(config: SnapshotConfig) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let config = SnapshotConfig {
            snapshot_root: dir.path().join("snapshots"),
            ..config
        };
        Self { dir, config }
    }

    pub fn manager(&self) -> SnapshotManager {
        SnapshotManager::from_config(&self.config).unwrap()
    }

    pub fn root(&self) -> &Path {
        &self.config.snapshot_root
    }

    /// A fresh, nonexistent restore target.
    pub fn target(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
