use repovault_common::CompressionFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::codec::{Codec, DEFAULT_ZSTD_LEVEL};

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("zstd_level must be between 1 and 22, got {0}")]
    InvalidZstdLevel(i32),
}

/// Snapshot manager settings.
///
/// Every field has a default, so a config file only needs the keys it changes:
/// ```json
/// { "snapshot_root": "/var/lib/repovault", "compress": "none" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Directory holding the registry and one subdirectory per snapshot.
    pub snapshot_root: PathBuf,
    /// Primary compression algorithm for the clean capture.
    pub compress: CompressionFormat,
    pub zstd_level: i32,
    /// Gate for the trial extraction after creation.
    pub verify_restore: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_root: PathBuf::from(".repovault/snapshots"),
            compress: CompressionFormat::Zstd,
            zstd_level: DEFAULT_ZSTD_LEVEL,
            verify_restore: true,
        }
    }
}

impl SnapshotConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=22).contains(&self.zstd_level) {
            return Err(ConfigError::InvalidZstdLevel(self.zstd_level));
        }
        Ok(())
    }

    /// The compression backend this configuration selects.
    pub fn codec(&self) -> Codec {
        match self.compress {
            CompressionFormat::Zstd => Codec::Zstd {
                level: self.zstd_level,
            },
            CompressionFormat::None => Codec::None,
        }
    }
}
