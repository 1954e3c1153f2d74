use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Errors from the version-control collaborator.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("no version-control metadata found at {0}")]
    NotARepository(PathBuf),
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("unexpected output from `{command}`: {detail}")]
    BadOutput { command: String, detail: String },
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl VcsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VcsError::Io {
            path: path.into(),
            source,
        }
    }
}

/// The primitives the capturer and collector need from version control.
pub trait VersionControl {
    /// Whether `path` holds version-control metadata of its own.
    fn is_repository(&self, path: &Path) -> bool;

    /// Write an uncompressed tar of the tracked content at `rev` to `dest`,
    /// holding every committed file byte for byte.
    fn export_tracked(&self, repo: &Path, rev: &str, dest: &Path) -> Result<(), VcsError>;

    /// Full commit id that `HEAD` resolves to.
    fn head_commit(&self, repo: &Path) -> Result<String, VcsError>;

    /// Checked-out branch name, or `HEAD` when detached.
    fn current_branch(&self, repo: &Path) -> Result<String, VcsError>;

    /// Repository-relative paths that differ from `rev`: tracked files with
    /// staged or unstaged edits, plus untracked files that are not ignored.
    fn dirty_files(&self, repo: &Path, rev: &str) -> Result<Vec<PathBuf>, VcsError>;
}

/// [`VersionControl`] backed by the `git` command-line tool.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific git executable.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run<I, S>(&self, repo: &Path, args: I) -> Result<Vec<u8>, VcsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let command = format!(
            "git {}",
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        tracing::debug!(%command, repo = %repo.display(), "running git");

        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(repo)
            .output()
            .map_err(|source| VcsError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn run_line(&self, repo: &Path, args: &[&str]) -> Result<String, VcsError> {
        let out = self.run(repo, args)?;
        let line = String::from_utf8_lossy(&out).trim().to_string();
        if line.is_empty() {
            return Err(VcsError::BadOutput {
                command: format!("git {}", args.join(" ")),
                detail: "empty output".into(),
            });
        }
        Ok(line)
    }
}

impl VersionControl for GitCli {
    fn is_repository(&self, path: &Path) -> bool {
        // `.git` is a directory in a normal clone and a file in a linked worktree.
        path.join(".git").exists()
    }

    /// Builds the tar from the tree objects rather than `git archive`, which
    /// honours `export-ignore` and `export-subst` and so drops or rewrites
    /// committed files.
    fn export_tracked(&self, repo: &Path, rev: &str, dest: &Path) -> Result<(), VcsError> {
        let listing = self.run(repo, ["ls-tree", "-r", "-z", "--full-tree", rev])?;
        let entries = parse_ls_tree(&listing).map_err(|detail| VcsError::BadOutput {
            command: format!("git ls-tree -r -z --full-tree {rev}"),
            detail,
        })?;
        let commit_time = self.run_line(repo, &["show", "-s", "--format=%ct", rev])?;
        let mtime = commit_time.parse::<u64>().map_err(|e| VcsError::BadOutput {
            command: format!("git show -s --format=%ct {rev}"),
            detail: format!("{commit_time:?}: {e}"),
        })?;

        let file = std::fs::File::create(dest).map_err(|e| VcsError::io(dest, e))?;
        let mut builder = tar::Builder::new(BufWriter::new(file));
        let mut objects = CatFileBatch::spawn(&self.program, repo)?;
        for entry in &entries {
            append_tree_entry(&mut builder, &mut objects, entry, mtime)
                .map_err(|e| e.at(dest))?;
        }
        objects.finish()?;

        let mut out = builder.into_inner().map_err(|e| VcsError::io(dest, e))?;
        out.flush().map_err(|e| VcsError::io(dest, e))?;
        tracing::debug!(rev, entries = entries.len(), "tree exported");
        Ok(())
    }

    fn head_commit(&self, repo: &Path) -> Result<String, VcsError> {
        self.run_line(repo, &["rev-parse", "--verify", "HEAD"])
    }

    fn current_branch(&self, repo: &Path) -> Result<String, VcsError> {
        self.run_line(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn dirty_files(&self, repo: &Path, rev: &str) -> Result<Vec<PathBuf>, VcsError> {
        let changed = self.run(repo, ["diff", "--name-only", "-z", "--no-renames", rev, "--"])?;
        let untracked = self.run(repo, ["ls-files", "--others", "--exclude-standard", "-z"])?;

        let mut paths = BTreeSet::new();
        paths.extend(split_nul(&changed));
        paths.extend(split_nul(&untracked));
        Ok(paths.into_iter().collect())
    }
}

/// Split `-z` style output into paths.
fn split_nul(out: &[u8]) -> impl Iterator<Item = PathBuf> + '_ {
    out.split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(path_from_bytes)
}

#[cfg(unix)]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

const MODE_EXECUTABLE: u32 = 0o100755;
const MODE_SYMLINK: u32 = 0o120000;
const MODE_GITLINK: u32 = 0o160000;

/// One record of `git ls-tree -r -z`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TreeEntry {
    mode: u32,
    oid: String,
    path: PathBuf,
}

/// Parse `<mode> SP <type> SP <oid> TAB <path> NUL` records.
fn parse_ls_tree(out: &[u8]) -> Result<Vec<TreeEntry>, String> {
    let mut entries = Vec::new();
    for record in out.split(|b| *b == 0).filter(|r| !r.is_empty()) {
        let tab = record
            .iter()
            .position(|b| *b == b'\t')
            .ok_or_else(|| format!("no path in {:?}", String::from_utf8_lossy(record)))?;
        let info = std::str::from_utf8(&record[..tab]).map_err(|e| e.to_string())?;
        let mut fields = info.split(' ');
        let (Some(mode), Some(_kind), Some(oid), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(format!("malformed entry {info:?}"));
        };
        entries.push(TreeEntry {
            mode: u32::from_str_radix(mode, 8).map_err(|e| format!("mode {mode:?}: {e}"))?,
            oid: oid.to_string(),
            path: path_from_bytes(&record[tab + 1..]),
        });
    }
    Ok(entries)
}

/// Failure while writing one tree entry into the archive.
enum AppendError {
    Vcs(VcsError),
    Io(std::io::Error),
}

impl AppendError {
    fn at(self, dest: &Path) -> VcsError {
        match self {
            AppendError::Vcs(e) => e,
            AppendError::Io(e) => VcsError::io(dest, e),
        }
    }
}

impl From<VcsError> for AppendError {
    fn from(e: VcsError) -> Self {
        AppendError::Vcs(e)
    }
}

impl From<std::io::Error> for AppendError {
    fn from(e: std::io::Error) -> Self {
        AppendError::Io(e)
    }
}

fn append_tree_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    objects: &mut CatFileBatch,
    entry: &TreeEntry,
    mtime: u64,
) -> Result<(), AppendError> {
    let mut header = tar::Header::new_gnu();
    header.set_mtime(mtime);

    match entry.mode {
        // Submodules are exported as empty directories.
        MODE_GITLINK => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, &entry.path, std::io::empty())?;
        }
        MODE_SYMLINK => {
            let target = objects.read_blob(&entry.oid)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, &entry.path, path_from_bytes(&target))?;
        }
        mode => {
            let size = objects.open_blob(&entry.oid)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(if mode == MODE_EXECUTABLE { 0o755 } else { 0o644 });
            header.set_size(size);
            builder.append_data(&mut header, &entry.path, objects.body(size))?;
            objects.end_blob()?;
        }
    }
    Ok(())
}

const CAT_FILE: &str = "git cat-file --batch";

/// A long-running `git cat-file --batch` that streams object contents.
struct CatFileBatch {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl CatFileBatch {
    fn spawn(program: &Path, repo: &Path) -> Result<Self, VcsError> {
        let mut child = Command::new(program)
            .args(["cat-file", "--batch"])
            .current_dir(repo)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| VcsError::Spawn {
                command: CAT_FILE.into(),
                source,
            })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        match stdout {
            Some(stdout) => Ok(Self {
                child,
                stdin,
                stdout,
            }),
            None => Err(protocol_error("stdout was not captured")),
        }
    }

    /// Request `oid` and return the size of its content.
    fn open_blob(&mut self, oid: &str) -> Result<u64, VcsError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| protocol_error("stdin already closed"))?;
        writeln!(stdin, "{oid}")
            .and_then(|_| stdin.flush())
            .map_err(|e| protocol_error(&e.to_string()))?;

        let mut line = String::new();
        self.stdout
            .read_line(&mut line)
            .map_err(|e| protocol_error(&e.to_string()))?;
        let mut fields = line.trim_end().split(' ');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(_), Some("blob"), Some(size)) => size
                .parse()
                .map_err(|_| protocol_error(&format!("bad size in {line:?}"))),
            _ => Err(protocol_error(&format!("unexpected header {line:?}"))),
        }
    }

    /// The content of the blob just opened.
    fn body(&mut self, size: u64) -> impl Read + '_ {
        (&mut self.stdout).take(size)
    }

    /// Consume the newline that follows each object.
    fn end_blob(&mut self) -> Result<(), VcsError> {
        let mut newline = [0u8; 1];
        self.stdout
            .read_exact(&mut newline)
            .map_err(|e| protocol_error(&e.to_string()))?;
        if newline[0] != b'\n' {
            return Err(protocol_error("object not followed by a newline"));
        }
        Ok(())
    }

    fn read_blob(&mut self, oid: &str) -> Result<Vec<u8>, VcsError> {
        let size = self.open_blob(oid)?;
        let mut content = Vec::new();
        self.body(size)
            .read_to_end(&mut content)
            .map_err(|e| protocol_error(&e.to_string()))?;
        if content.len() as u64 != size {
            return Err(protocol_error(&format!("object {oid} truncated")));
        }
        self.end_blob()?;
        Ok(content)
    }

    fn finish(mut self) -> Result<(), VcsError> {
        drop(self.stdin.take());
        let status = self.child.wait().map_err(|source| VcsError::Spawn {
            command: CAT_FILE.into(),
            source,
        })?;
        if !status.success() {
            return Err(VcsError::CommandFailed {
                command: CAT_FILE.into(),
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}

impl Drop for CatFileBatch {
    fn drop(&mut self) {
        // Still open means the export bailed out early.
        if self.stdin.take().is_some() {
            if let Err(e) = self.child.kill() {
                tracing::debug!(error = %e, "could not stop git cat-file");
            }
            if let Err(e) = self.child.wait() {
                tracing::debug!(error = %e, "could not reap git cat-file");
            }
        }
    }
}

fn protocol_error(detail: &str) -> VcsError {
    VcsError::BadOutput {
        command: CAT_FILE.into(),
        detail: detail.to_string(),
    }
}
