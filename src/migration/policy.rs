//! Migration policy constants
//!
//! The thresholds deciding when funds are worth moving and when they count
//! as confirmed. Persisted in migration-config.json next to the node config.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::node::config::ConfigError;
use crate::wallet::amount::{Amount, DEFAULT_FEE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationPolicy {
    /// Below this total a plan is not worth arming (0.001)
    pub min_viable_amount: Amount,
    /// Confirmations before funds count as confirmed
    pub min_confirmations: u32,
    /// Fee attached to every migration transaction
    pub fee: Amount,
    /// Turnstile cap per run; unlimited when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_amount_per_run: Option<Amount>,
    /// How often a worker checks its plan
    pub tick_interval_secs: u64,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self {
            min_viable_amount: Amount::from_units(100_000),
            min_confirmations: 1,
            fee: DEFAULT_FEE,
            max_amount_per_run: None,
            tick_interval_secs: 60,
        }
    }
}

impl MigrationPolicy {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    /// Get the path to the migration config file
    pub fn config_path() -> PathBuf {
        crate::app_data_dir().join("migration-config.json")
    }

    /// Load the policy, falling back to defaults
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            log::info!("No migration config file found at {:?}, using defaults", path);
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(policy) => {
                    log::info!("Loaded migration config from {:?}", path);
                    policy
                }
                Err(e) => {
                    log::error!("Failed to parse migration config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                log::error!("Failed to read migration config file: {}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })?;

        log::info!("Migration config saved to {:?}", path);
        Ok(())
    }
}
