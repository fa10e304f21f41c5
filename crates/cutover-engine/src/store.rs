//! Durable storage for migration records.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StoreError;
use crate::state::{MigrationState, validate_migration_id};

/// Key-value persistence for migration records, one record per migration id.
///
/// `save` must be atomic: after a crash a reader sees either the previous or
/// the new record, never a mix.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<MigrationState>, StoreError>;
    async fn save(&self, state: &MigrationState) -> Result<(), StoreError>;
    async fn list_ids(&self) -> Result<Vec<String>, StoreError>;
}

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, MigrationState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MigrationStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Option<MigrationState>, StoreError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn save(&self, state: &MigrationState) -> Result<(), StoreError> {
        self.records.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// One JSON file per migration under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_migration_id(id)?;
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

#[async_trait]
impl MigrationStore for FileStore {
    async fn load(&self, id: &str) -> Result<Option<MigrationState>, StoreError> {
        let path = self.path_for(id)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &MigrationState) -> Result<(), StoreError> {
        let path = self.path_for(&state.id)?;
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(state)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;
        debug!(migration = %state.id, path = %path.display(), "saved migration record");
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = name.strip_suffix(".json") {
                if validate_migration_id(id).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
