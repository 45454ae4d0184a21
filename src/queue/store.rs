//! Job records shared by every node running an admission loop

use crate::error::{NluError, NluResult};
use crate::language::LanguageCode;
use crate::storage::{FileSystemStorage, StorageBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Queue identity of a job: one per `(bot, language)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    pub bot_id: String,
    pub language: LanguageCode,
}

impl JobKey {
    pub fn new(bot_id: impl Into<String>, language: LanguageCode) -> Self {
        Self {
            bot_id: bot_id.into(),
            language,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "training:{}:{}", self.bot_id, self.language)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Training,
    Done,
}

/// A key has at most one record, so it is always in exactly one of
/// pending, training or done (or none of them).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub key: JobKey,
    pub state: JobState,
    pub progress: f64,
    pub queued_at: DateTime<Utc>,
    /// Node executing the job while `Training`
    #[serde(default)]
    pub owner: Option<String>,
}

impl JobRecord {
    pub fn pending(key: JobKey) -> Self {
        Self {
            key,
            state: JobState::Pending,
            progress: 0.0,
            queued_at: Utc::now(),
            owner: None,
        }
    }
}

// ============================================================================
// Trait Definitions
// ============================================================================

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, key: &JobKey) -> NluResult<Option<JobRecord>>;

    /// Inserts or replaces the record of `record.key`
    async fn put(&self, record: JobRecord) -> NluResult<()>;

    async fn remove(&self, key: &JobKey) -> NluResult<Option<JobRecord>>;

    async fn list(&self) -> NluResult<Vec<JobRecord>>;

    /// Asks whichever node runs `key` to cancel it. Kept apart from the
    /// record so progress writes by the owner cannot drop it.
    async fn request_cancel(&self, key: &JobKey) -> NluResult<()>;

    /// Consumes a pending cancel request
    async fn take_cancel_request(&self, key: &JobKey) -> NluResult<bool>;

    async fn list_in(&self, state: JobState) -> NluResult<Vec<JobRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.state == state)
            .collect())
    }
}

// ============================================================================
// Production Implementations
// ============================================================================

/// Single-node store
#[derive(Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<JobKey, JobRecord>>,
    cancel_requests: RwLock<HashSet<JobKey>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, key: &JobKey) -> NluResult<Option<JobRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, record: JobRecord) -> NluResult<()> {
        self.records.write().await.insert(record.key.clone(), record);
        Ok(())
    }

    async fn remove(&self, key: &JobKey) -> NluResult<Option<JobRecord>> {
        Ok(self.records.write().await.remove(key))
    }

    async fn list(&self) -> NluResult<Vec<JobRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn request_cancel(&self, key: &JobKey) -> NluResult<()> {
        self.cancel_requests.write().await.insert(key.clone());
        Ok(())
    }

    async fn take_cancel_request(&self, key: &JobKey) -> NluResult<bool> {
        Ok(self.cancel_requests.write().await.remove(key))
    }
}

/// Cluster store: one JSON file per key in a directory every node can reach
pub struct FileJobStore {
    dir: PathBuf,
    storage: Arc<dyn StorageBackend>,
}

const JOB_EXTENSION: &str = "job";

impl FileJobStore {
    pub fn new(dir: PathBuf) -> Self {
        Self::new_with_storage(dir, Arc::new(FileSystemStorage::new()))
    }

    pub fn new_with_storage(dir: PathBuf, storage: Arc<dyn StorageBackend>) -> Self {
        Self { dir, storage }
    }

    fn path_of(&self, key: &JobKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hex::encode(key.to_string()), JOB_EXTENSION))
    }

    fn cancel_path_of(&self, key: &JobKey) -> PathBuf {
        self.dir.join(format!("{}.cancel", hex::encode(key.to_string())))
    }

    fn parse(bytes: &[u8]) -> Option<JobRecord> {
        serde_json::from_slice(bytes).ok()
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn get(&self, key: &JobKey) -> NluResult<Option<JobRecord>> {
        let bytes = self
            .storage
            .load(&self.path_of(key))
            .await
            .map_err(|e| NluError::Storage(format!("{:#}", e)))?;
        Ok(bytes.as_deref().and_then(Self::parse))
    }

    async fn put(&self, record: JobRecord) -> NluResult<()> {
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| NluError::Storage(format!("cannot serialize job: {}", e)))?;
        self.storage
            .save(&self.path_of(&record.key), &bytes)
            .await
            .map_err(|e| NluError::Storage(format!("{:#}", e)))
    }

    async fn remove(&self, key: &JobKey) -> NluResult<Option<JobRecord>> {
        let previous = self.get(key).await?;
        self.storage
            .remove(&self.path_of(key))
            .await
            .map_err(|e| NluError::Storage(format!("{:#}", e)))?;
        Ok(previous)
    }

    async fn list(&self) -> NluResult<Vec<JobRecord>> {
        let files = self
            .storage
            .list(&self.dir, JOB_EXTENSION)
            .await
            .map_err(|e| NluError::Storage(format!("{:#}", e)))?;

        let mut records = Vec::with_capacity(files.len());
        for file in files {
            match self.storage.load(&file).await {
                Ok(Some(bytes)) => match Self::parse(&bytes) {
                    Some(record) => records.push(record),
                    None => tracing::warn!(file = ?file, "Ignoring unreadable job record"),
                },
                // Removed by another node between list and load
                Ok(None) => {}
                Err(e) => return Err(NluError::Storage(format!("{:#}", e))),
            }
        }
        Ok(records)
    }

    async fn request_cancel(&self, key: &JobKey) -> NluResult<()> {
        self.storage
            .save(&self.cancel_path_of(key), b"")
            .await
            .map_err(|e| NluError::Storage(format!("{:#}", e)))
    }

    async fn take_cancel_request(&self, key: &JobKey) -> NluResult<bool> {
        self.storage
            .remove(&self.cancel_path_of(key))
            .await
            .map_err(|e| NluError::Storage(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(bot: &str, lang: &str) -> JobKey {
        JobKey::new(bot, lang.parse().unwrap())
    }

    #[test]
    fn test_job_key_display() {
        assert_eq!(key("b1", "en").to_string(), "training:b1:en");
    }

    async fn exercise(store: &dyn JobStore) {
        store.put(JobRecord::pending(key("b1", "en"))).await.unwrap();
        store.put(JobRecord::pending(key("b1", "fr"))).await.unwrap();

        let mut record = store.get(&key("b1", "en")).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Pending);

        record.state = JobState::Training;
        record.owner = Some("node-a".into());
        store.put(record).await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);
        assert_eq!(store.list_in(JobState::Training).await.unwrap().len(), 1);
        assert_eq!(store.list_in(JobState::Pending).await.unwrap().len(), 1);

        let removed = store.remove(&key("b1", "en")).await.unwrap().unwrap();
        assert_eq!(removed.owner.as_deref(), Some("node-a"));
        assert!(store.get(&key("b1", "en")).await.unwrap().is_none());
        assert!(store.remove(&key("b1", "en")).await.unwrap().is_none());
    }

    async fn exercise_cancel_requests(store: &dyn JobStore) {
        assert!(!store.take_cancel_request(&key("b1", "en")).await.unwrap());
        store.request_cancel(&key("b1", "en")).await.unwrap();
        assert!(store.take_cancel_request(&key("b1", "en")).await.unwrap());
        assert!(!store.take_cancel_request(&key("b1", "en")).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_requests() {
        exercise_cancel_requests(&MemoryJobStore::new()).await;
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::new(temp_dir.path().to_path_buf());
        exercise_cancel_requests(&store).await;
        // Markers are not job records
        store.request_cancel(&key("b2", "en")).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let temp_dir = TempDir::new().unwrap();
        exercise(&FileJobStore::new(temp_dir.path().join("jobs"))).await;
    }

    #[tokio::test]
    async fn test_file_store_is_shared_between_instances() {
        let temp_dir = TempDir::new().unwrap();
        let a = FileJobStore::new(temp_dir.path().to_path_buf());
        let b = FileJobStore::new(temp_dir.path().to_path_buf());

        a.put(JobRecord::pending(key("weird:bot/id", "en"))).await.unwrap();
        let seen = b.get(&key("weird:bot/id", "en")).await.unwrap().unwrap();
        assert_eq!(seen.key.bot_id, "weird:bot/id");
    }

    #[tokio::test]
    async fn test_file_store_skips_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::new(temp_dir.path().to_path_buf());
        store.put(JobRecord::pending(key("b1", "en"))).await.unwrap();
        std::fs::write(temp_dir.path().join("garbage.job"), b"{not json").unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
