//! Durable plan storage
//!
//! One JSON file per plan, named by plan id. Writes go to a temporary file
//! that is synced and renamed over the old record, so a crash leaves either
//! the previous or the new version on disk.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::plan::MigrationPlan;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("plan store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize plan: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt plan record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    /// Default location under the app data directory
    pub fn default_dir() -> PathBuf {
        crate::app_data_dir().join("migrations")
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Durably write `plan`, replacing any previous record
    pub fn save(&self, plan: &MigrationPlan) -> Result<(), StoreError> {
        let path = self.path_for(&plan.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(plan)?;

        let mut file = File::create(&tmp).map_err(io_error(&tmp))?;
        file.write_all(&content).map_err(io_error(&tmp))?;
        file.sync_all().map_err(io_error(&tmp))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        log::debug!("Persisted migration plan {} ({:?})", plan.id, plan.status);
        Ok(())
    }

    pub fn load(&self, id: &Uuid) -> Result<Option<MigrationPlan>, StoreError> {
        let path = self.path_for(id);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { path, source })
    }

    /// Every readable plan. Corrupt records are logged and skipped so one bad
    /// file cannot block the others from resuming.
    pub fn load_all(&self) -> Result<Vec<MigrationPlan>, StoreError> {
        let mut plans = Vec::new();

        for entry in fs::read_dir(&self.dir).map_err(io_error(&self.dir))? {
            let path = entry.map_err(io_error(&self.dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match fs::read(&path)
                .map_err(io_error(&path))
                .and_then(|content| {
                    serde_json::from_slice::<MigrationPlan>(&content).map_err(|source| {
                        StoreError::Corrupt {
                            path: path.clone(),
                            source,
                        }
                    })
                }) {
                Ok(plan) => plans.push(plan),
                Err(e) => log::error!("Skipping migration plan record: {}", e),
            }
        }

        plans.sort_by_key(|plan| plan.created_at);
        Ok(plans)
    }

    pub fn remove(&self, id: &Uuid) -> Result<(), StoreError> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::plan::{MigrationKind, PlanStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn plan() -> MigrationPlan {
        MigrationPlan::new(
            MigrationKind::NullifierReset,
            ["zs1a".to_string(), "zs1b".to_string()].into_iter().collect(),
            "zs1dest".to_string(),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn test_save_load_replace() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path().join("plans")).unwrap();
        let mut plan = plan();

        assert!(store.load(&plan.id).unwrap().is_none());
        store.save(&plan).unwrap();
        assert_eq!(store.load(&plan.id).unwrap(), Some(plan.clone()));

        plan.status = PlanStatus::Running;
        plan.completed_txids.push("txid-1".to_string());
        store.save(&plan).unwrap();
        assert_eq!(store.load(&plan.id).unwrap(), Some(plan.clone()));
        assert!(!store.dir().join(format!("{}.json.tmp", plan.id)).exists());

        store.remove(&plan.id).unwrap();
        store.remove(&plan.id).unwrap();
        assert!(store.load(&plan.id).unwrap().is_none());
    }

    #[test]
    fn test_load_all_skips_corrupt_records() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();

        let first = plan();
        let second = plan();
        store.save(&first).unwrap();
        store.save(&second).unwrap();
        fs::write(dir.path().join("garbage.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let plans = store.load_all().unwrap();
        assert_eq!(plans.len(), 2);
        assert!(plans.iter().any(|p| p.id == first.id));
        assert!(plans.iter().any(|p| p.id == second.id));
    }

    #[test]
    fn test_corrupt_single_record() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let plan = plan();
        fs::write(dir.path().join(format!("{}.json", plan.id)), "[]").unwrap();

        assert!(matches!(store.load(&plan.id), Err(StoreError::Corrupt { .. })));
    }
}
