use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use repovault_persist::{
    CompressionFormat, CompressionStatus, RestoreMode, SnapshotConfig, SnapshotId,
    SnapshotManager, VerificationStatus,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "repovault", about = "Snapshot and restore git working trees")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Snapshot root, overriding the config file
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Compression for new snapshots (zstd or none)
    #[arg(long, global = true)]
    compress: Option<CompressionFormat>,

    /// Skip the trial extraction after create
    #[arg(long, global = true)]
    no_verify_restore: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot a repository's committed tree and uncommitted changes
    Create {
        /// Repository working tree
        #[arg(default_value = ".")]
        repo: PathBuf,
        /// Name to file the snapshot under (defaults to the directory name)
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long, default_value = "manual snapshot")]
        reason: String,
    },
    /// Write a snapshot back into a directory
    Restore {
        id: String,
        target: PathBuf,
        /// Restore into a non-empty directory, replacing files at archived paths
        #[arg(long)]
        overwrite: bool,
    },
    /// List snapshots, oldest first
    List {
        /// Only this repository
        #[arg(long)]
        repo: Option<String>,
    },
    /// Show one snapshot's metadata
    Info { id: String },
    /// Delete a snapshot and its registry entry
    Delete { id: String },
    /// Re-hash a snapshot and trial-extract it
    Verify {
        id: String,
        /// Only compare the hash
        #[arg(long)]
        no_extract: bool,
    },
    /// Delete all but the newest snapshots of a repository
    Prune {
        repo: String,
        #[arg(short, long, default_value = "5")]
        keep: usize,
    },
    /// Report directories and registry entries that disagree
    Orphans,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    tracing::debug!(root = %config.snapshot_root.display(), "using snapshot root");
    let mut manager = SnapshotManager::from_config(&config)?;

    match cli.command {
        Commands::Create { repo, name, reason } => {
            let name = match name {
                Some(name) => name,
                None => repo_name(&repo)?,
            };
            let created = manager.create_snapshot(&repo, &name, &reason)?;
            println!("{}", created.metadata);
            match &created.compression {
                CompressionStatus::FellBack { reason, .. } => {
                    println!("note: stored uncompressed ({reason})");
                }
                CompressionStatus::Compressed { .. } | CompressionStatus::Disabled => {}
            }
            if let VerificationStatus::Failed { reason } = &created.verification {
                println!("warning: verification failed: {reason}");
            }
            for path in &created.dirty.missing {
                println!("note: {} deleted in working tree, recorded", path.display());
            }
            for path in &created.dirty.skipped {
                println!("note: {} skipped", path.display());
            }
        }
        Commands::Restore {
            id,
            target,
            overwrite,
        } => {
            let mode = if overwrite {
                RestoreMode::Overwrite
            } else {
                RestoreMode::EmptyTargetOnly
            };
            let report = manager.restore_snapshot(&SnapshotId::from(id), &target, mode)?;
            println!(
                "Restored {} into {}: {} clean files, {} dirty files, {} deleted",
                report.snapshot_id,
                report.target.display(),
                report.clean_files,
                report.dirty_files,
                report.deleted_files
            );
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            if !report.verified {
                println!("warning: snapshot is UNVERIFIED");
            }
        }
        Commands::List { repo } => {
            let snapshots = manager.list_snapshots(repo.as_deref());
            if snapshots.is_empty() {
                println!("No snapshots");
            }
            for meta in snapshots {
                println!("{meta}");
            }
        }
        Commands::Info { id } => {
            let meta = manager.get_snapshot_info(&SnapshotId::from(id))?;
            println!("{meta}");
            println!("  path:   {}", meta.repo_path.display());
            println!("  commit: {}", meta.git_commit);
            println!("  hash:   {}", meta.verification_hash.as_deref().unwrap_or("-"));
            println!("  taken:  {}", meta.created_at.to_rfc3339());
        }
        Commands::Delete { id } => {
            let removed = manager.delete_snapshot(&SnapshotId::from(id))?;
            println!("Deleted {}", removed.snapshot_id);
        }
        Commands::Verify { id, no_extract } => {
            let report = manager.verify_snapshot(&SnapshotId::from(id), !no_extract)?;
            println!(
                "{}: hash {}, {}",
                report.snapshot_id,
                if report.hash_matches() { "OK" } else { "MISMATCH" },
                match &report.status {
                    VerificationStatus::Passed {
                        trial_extracted: true,
                    } => "trial extraction OK".to_string(),
                    VerificationStatus::Passed {
                        trial_extracted: false,
                    } => "not extracted".to_string(),
                    VerificationStatus::Failed { reason } => format!("FAILED: {reason}"),
                }
            );
            if !report.is_intact() {
                anyhow::bail!("snapshot {} failed verification", report.snapshot_id);
            }
        }
        Commands::Prune { repo, keep } => {
            let removed = manager.prune_snapshots(&repo, keep)?;
            println!("Pruned {} snapshot(s) of {repo}", removed.len());
            for id in removed {
                println!("  {id}");
            }
        }
        Commands::Orphans => {
            let report = manager.find_orphans()?;
            if report.is_empty() {
                println!("Registry and snapshot root agree");
            }
            for dir in &report.orphan_dirs {
                println!("unregistered directory: {}", dir.display());
            }
            for id in &report.dangling_entries {
                println!("entry without directory: {id}");
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<SnapshotConfig> {
    let mut config = match &cli.config {
        Some(path) => SnapshotConfig::load(path)?,
        None => SnapshotConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.snapshot_root = root.clone();
    }
    if let Some(format) = cli.compress {
        config.compress = format;
    }
    if cli.no_verify_restore {
        config.verify_restore = false;
    }
    config.validate()?;
    Ok(config)
}

fn repo_name(repo: &Path) -> anyhow::Result<String> {
    let canonical = repo
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", repo.display()))?;
    canonical
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .context("repository path has no directory name")
}
