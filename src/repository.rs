//! Content-addressed model repository
//!
//! Artifacts are stored as zstd-compressed JSON under
//! `<model_dir>/<sha256(model_id + secret)>.model`. Knowing the tenant secret is
//! required to address an artifact, and re-saving the same id under the same
//! secret overwrites the previous file. Undecodable artifacts are deleted and
//! reported as absent so that the model simply gets retrained.

use crate::engine::Model;
use crate::error::{NluError, NluResult};
use crate::model_id::{BriefId, ModelId};
use crate::storage::{FileSystemStorage, StorageBackend};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MODEL_EXTENSION: &str = "model";

pub struct ModelRepository {
    model_dir: PathBuf,
    storage: Arc<dyn StorageBackend>,
}

impl ModelRepository {
    /// Create a repository over the local filesystem
    pub fn new(model_dir: PathBuf) -> Self {
        Self::new_with_storage(model_dir, Arc::new(FileSystemStorage::new()))
    }

    pub fn new_with_storage(model_dir: PathBuf, storage: Arc<dyn StorageBackend>) -> Self {
        Self { model_dir, storage }
    }

    /// Create the model directory
    pub async fn init(&self) -> NluResult<()> {
        tokio::fs::create_dir_all(&self.model_dir).await?;
        tracing::info!(model_dir = ?self.model_dir, "Model repository ready");
        Ok(())
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub async fn save_model(&self, model: &Model, secret: &str) -> NluResult<()> {
        let path = self.model_path(&model.id, secret);
        let serialized = serde_json::to_vec(model)
            .map_err(|e| NluError::Storage(format!("cannot serialize model: {}", e)))?;

        let archive = tokio::task::spawn_blocking(move || compress(&serialized))
            .await
            .map_err(|e| NluError::Storage(format!("compression task failed: {}", e)))??;

        self.storage
            .save(&path, &archive)
            .await
            .map_err(storage_error)?;

        tracing::info!(model_id = %model.id, bytes = archive.len(), "Model saved");
        Ok(())
    }

    /// Returns `None` when missing; corrupt artifacts are deleted and reported missing
    pub async fn get_model(&self, model_id: &ModelId, secret: &str) -> NluResult<Option<Model>> {
        let path = self.model_path(model_id, secret);
        let model = self.read_artifact(&path).await?;

        match model {
            Some(model) if model.id == *model_id => Ok(Some(model)),
            Some(model) => {
                tracing::warn!(
                    expected = %model_id,
                    found = %model.id,
                    "Artifact does not hold the requested model, deleting"
                );
                self.storage.remove(&path).await.map_err(storage_error)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn has_model(&self, model_id: &ModelId, secret: &str) -> NluResult<bool> {
        Ok(self.get_model(model_id, secret).await?.is_some())
    }

    /// Latest (by `finished_at`) model owned by `secret` whose id matches every known field of `brief`
    pub async fn latest_model(&self, brief: &BriefId, secret: &str) -> NluResult<Option<Model>> {
        let mut latest: Option<Model> = None;

        for model in self.owned_models(secret).await? {
            if !brief.matches(&model.id) {
                continue;
            }
            if latest
                .as_ref()
                .is_none_or(|current| model.finished_at > current.finished_at)
            {
                latest = Some(model);
            }
        }

        Ok(latest)
    }

    /// Ids of every model stored under `secret`
    pub async fn list_models(&self, secret: &str) -> NluResult<Vec<ModelId>> {
        Ok(self
            .owned_models(secret)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect())
    }

    pub async fn delete_model(&self, model_id: &ModelId, secret: &str) -> NluResult<bool> {
        let removed = self
            .storage
            .remove(&self.model_path(model_id, secret))
            .await
            .map_err(storage_error)?;
        if removed {
            tracing::info!(model_id = %model_id, "Model deleted");
        }
        Ok(removed)
    }

    fn model_path(&self, model_id: &ModelId, secret: &str) -> PathBuf {
        self.model_dir.join(model_file_name(model_id, secret))
    }

    /// Models whose file name proves knowledge of `secret`
    async fn owned_models(&self, secret: &str) -> NluResult<Vec<Model>> {
        let files = self
            .storage
            .list(&self.model_dir, MODEL_EXTENSION)
            .await
            .map_err(storage_error)?;

        let mut models = Vec::new();
        for path in files {
            let Some(model) = self.read_artifact(&path).await? else {
                continue;
            };
            let owned = path
                .file_name()
                .is_some_and(|name| *name == *model_file_name(&model.id, secret));
            if owned {
                models.push(model);
            }
        }
        Ok(models)
    }

    async fn read_artifact(&self, path: &Path) -> NluResult<Option<Model>> {
        let Some(archive) = self.storage.load(path).await.map_err(storage_error)? else {
            return Ok(None);
        };

        let decoded = tokio::task::spawn_blocking(move || decompress(&archive))
            .await
            .map_err(|e| NluError::Storage(format!("decompression task failed: {}", e)))?
            .and_then(|bytes| {
                serde_json::from_slice::<Model>(&bytes)
                    .map_err(|e| NluError::Storage(format!("invalid model payload: {}", e)))
            });

        match decoded {
            Ok(model) => Ok(Some(model)),
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Corrupt model artifact, deleting");
                self.storage.remove(path).await.map_err(storage_error)?;
                Ok(None)
            }
        }
    }
}

/// `<sha256(model_id + secret)>.model`
pub fn model_file_name(model_id: &ModelId, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_id.to_string().as_bytes());
    hasher.update(secret.as_bytes());
    format!("{}.{}", hex::encode(hasher.finalize()), MODEL_EXTENSION)
}

const COMPRESSION_LEVEL: i32 = 3;

fn compress(bytes: &[u8]) -> NluResult<Vec<u8>> {
    Ok(zstd::bulk::compress(bytes, COMPRESSION_LEVEL)?)
}

fn decompress(bytes: &[u8]) -> NluResult<Vec<u8>> {
    zstd::stream::decode_all(bytes)
        .map_err(|e| NluError::Storage(format!("invalid model archive: {}", e)))
}

fn storage_error(err: anyhow::Error) -> NluError {
    NluError::Storage(format!("{:#}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ModelData;
    use crate::storage::mocks::MockStorage;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn model(content: &str, lang: &str, finished_offset_secs: i64) -> Model {
        let now = Utc::now();
        Model {
            id: ModelId {
                content_hash: content.to_string(),
                specification_hash: "00000000000000aa".to_string(),
                seed: 42,
                language_code: lang.parse().unwrap(),
            },
            started_at: now,
            finished_at: now + Duration::seconds(finished_offset_secs),
            data: ModelData {
                input: "in".to_string(),
                output: "out".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let repo = ModelRepository::new(temp_dir.path().to_path_buf());
        repo.init().await.unwrap();

        let m = model("0123456789abcdef", "en", 0);
        repo.save_model(&m, "secret").await.unwrap();

        let loaded = repo.get_model(&m.id, "secret").await.unwrap();
        assert_eq!(loaded, Some(m.clone()));
        assert!(repo.has_model(&m.id, "secret").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_secret_is_absent() {
        let temp_dir = TempDir::new().unwrap();
        let repo = ModelRepository::new(temp_dir.path().to_path_buf());

        let m = model("0123456789abcdef", "en", 0);
        repo.save_model(&m, "secret").await.unwrap();

        assert!(repo.get_model(&m.id, "other").await.unwrap().is_none());
        assert!(!repo.has_model(&m.id, "").await.unwrap());
    }

    #[tokio::test]
    async fn test_resave_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let repo = ModelRepository::new(temp_dir.path().to_path_buf());

        let m = model("0123456789abcdef", "en", 0);
        repo.save_model(&m, "secret").await.unwrap();
        repo.save_model(&m, "secret").await.unwrap();

        assert_eq!(repo.list_models("secret").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_self_heals() {
        let temp_dir = TempDir::new().unwrap();
        let repo = ModelRepository::new(temp_dir.path().to_path_buf());

        let m = model("0123456789abcdef", "en", 0);
        let path = temp_dir.path().join(model_file_name(&m.id, "secret"));
        std::fs::write(&path, b"definitely not a zstd archive").unwrap();

        assert!(repo.get_model(&m.id, "secret").await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_json_inside_valid_archive_self_heals() {
        let storage = Arc::new(MockStorage::new());
        let repo = ModelRepository::new_with_storage(PathBuf::from("/models"), storage.clone());

        let m = model("0123456789abcdef", "en", 0);
        let path = PathBuf::from("/models").join(model_file_name(&m.id, "secret"));
        storage
            .put_file(&path, &compress(b"{\"id\": 12").unwrap())
            .await;

        assert!(repo.get_model(&m.id, "secret").await.unwrap().is_none());
        assert!(storage.get_file(&path).await.is_none());
    }

    #[tokio::test]
    async fn test_latest_model_matches_brief_and_secret() {
        let storage = Arc::new(MockStorage::new());
        let repo = ModelRepository::new_with_storage(PathBuf::from("/models"), storage.clone());

        let older = model("1111111111111111", "en", 0);
        let newer = model("2222222222222222", "en", 60);
        let french = model("3333333333333333", "fr", 120);
        let foreign = model("4444444444444444", "en", 600);

        repo.save_model(&older, "s").await.unwrap();
        repo.save_model(&newer, "s").await.unwrap();
        repo.save_model(&french, "s").await.unwrap();
        repo.save_model(&foreign, "someone-else").await.unwrap();

        let brief = BriefId {
            language_code: Some("en".parse().unwrap()),
            specification_hash: Some("00000000000000aa".to_string()),
            ..Default::default()
        };
        let latest = repo.latest_model(&brief, "s").await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);

        let none = BriefId {
            language_code: Some("de".parse().unwrap()),
            ..Default::default()
        };
        assert!(repo.latest_model(&none, "s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_model() {
        let storage = Arc::new(MockStorage::new());
        let repo = ModelRepository::new_with_storage(PathBuf::from("/models"), storage.clone());

        let m = model("0123456789abcdef", "en", 0);
        repo.save_model(&m, "s").await.unwrap();
        assert!(repo.delete_model(&m.id, "s").await.unwrap());
        assert!(!repo.delete_model(&m.id, "s").await.unwrap());
        assert_eq!(storage.file_count().await, 0);
    }

    #[tokio::test]
    async fn test_save_error_propagates() {
        let storage = Arc::new(MockStorage::new());
        let repo = ModelRepository::new_with_storage(PathBuf::from("/models"), storage.clone());
        storage.set_save_error("Disk full".to_string()).await;

        let m = model("0123456789abcdef", "en", 0);
        assert!(matches!(
            repo.save_model(&m, "s").await,
            Err(NluError::Storage(_))
        ));
    }

    #[test]
    fn test_file_name_depends_on_secret() {
        let m = model("0123456789abcdef", "en", 0);
        assert_ne!(model_file_name(&m.id, "a"), model_file_name(&m.id, "b"));
        assert_eq!(model_file_name(&m.id, "a"), model_file_name(&m.id, "a"));
        assert!(model_file_name(&m.id, "a").ends_with(".model"));
    }
}
