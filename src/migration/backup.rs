//! Wallet backup before migration
//!
//! Moving every shielded note is only armed after the user confirms a
//! backup exists. [`backup_wallet`] makes that backup by copying the
//! daemon's wallet file and checking the copy against the original's
//! SHA256.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::node::config::NodeConfig;

/// Wallet file name inside the network data directory
pub const WALLET_FILE_NAME: &str = "wallet.dat";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("wallet file not found at {}", .0.display())]
    WalletNotFound(PathBuf),
    #[error("backup I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("backup at {} does not match the wallet file", .0.display())]
    VerifyFailed(PathBuf),
    #[error("acknowledged backup {} no longer exists", .0.display())]
    Missing(PathBuf),
}

/// The user's confirmation that the wallet is backed up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupAcknowledgment {
    pub acknowledged_at: DateTime<Utc>,
    /// Backup made by the wallet itself, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl BackupAcknowledgment {
    /// The user states they made a backup by other means
    pub fn user_confirmed() -> Self {
        Self {
            acknowledged_at: Utc::now(),
            backup_path: None,
            sha256: None,
        }
    }

    /// A wallet-made backup must still be on disk
    pub fn verify(&self) -> Result<(), BackupError> {
        match &self.backup_path {
            Some(path) if !path.exists() => Err(BackupError::Missing(path.clone())),
            _ => Ok(()),
        }
    }
}

/// Path of the daemon's wallet file for `config`
pub fn wallet_file_path(config: &NodeConfig) -> PathBuf {
    config.network_data_dir().join(WALLET_FILE_NAME)
}

/// Compute SHA256 hash of a file
pub fn compute_file_hash(path: &Path) -> Result<String, BackupError> {
    let io_err = |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(io_err)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Copy the wallet file to `dest` and verify the copy.
///
/// When `dest` is an existing directory a timestamped file name is used.
pub fn backup_wallet(config: &NodeConfig, dest: &Path) -> Result<BackupAcknowledgment, BackupError> {
    let source = wallet_file_path(config);
    if !source.exists() {
        return Err(BackupError::WalletNotFound(source));
    }

    let target = if dest.is_dir() {
        dest.join(format!(
            "wallet-backup-{}.dat",
            Utc::now().format("%Y%m%d-%H%M%S")
        ))
    } else {
        dest.to_path_buf()
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|source| BackupError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::copy(&source, &target).map_err(|e| BackupError::Io {
        path: target.clone(),
        source: e,
    })?;

    let expected = compute_file_hash(&source)?;
    let computed = compute_file_hash(&target)?;
    log::info!(
        "Wallet backup {}: computed={}, expected={}",
        target.display(),
        &computed[..16],
        &expected[..16]
    );
    if computed != expected {
        return Err(BackupError::VerifyFailed(target));
    }

    Ok(BackupAcknowledgment {
        acknowledged_at: Utc::now(),
        backup_path: Some(target),
        sha256: Some(computed),
    })
}
