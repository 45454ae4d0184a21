//! HTTP client for an out-of-process engine worker
//!
//! Protocol (all bodies JSON):
//! ```text
//! GET    /info                  -> EngineInfo
//! POST   /train                 {key, trainSet, previousModel?}   409 if key is training
//! GET    /train/{key}           -> {status, progress, model?, error?}
//! POST   /train/{key}/cancel
//! POST   /models                Model                              (load)
//! DELETE /models/{modelId}                                         (unload)
//! POST   /detect-lang           {text, models}  -> {language?}
//! POST   /predict/{modelId}     {text}          -> Prediction
//! POST   /spellcheck/{modelId}  {text}          -> {spellChecked}
//! ```
//! Training completion is observed by polling `GET /train/{key}` at a fixed
//! interval; a worker crash surfaces as a failed poll.

use super::{Engine, EngineInfo, Health, Model, Prediction, Specifications, TrainingOptions};
use crate::definitions::TrainSet;
use crate::error::{NluError, NluResult};
use crate::language::{LanguageCode, ModelsByLanguage};
use crate::model_id::ModelId;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum RemoteStatus {
    TrainingPending,
    Training,
    Done,
    Canceled,
    Errored,
}

#[derive(Debug, Deserialize)]
struct RemoteTrainingStatus {
    status: RemoteStatus,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    model: Option<Model>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartTrainingBody<'a> {
    key: &'a str,
    train_set: &'a TrainSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_model: Option<&'a ModelId>,
}

#[derive(Serialize)]
struct TextBody<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct DetectBody<'a> {
    text: &'a str,
    models: &'a ModelsByLanguage,
}

#[derive(Deserialize)]
struct DetectResponse {
    language: Option<LanguageCode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpellCheckResponse {
    spell_checked: String,
}

pub struct RemoteEngine {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    info: RwLock<EngineInfo>,
    loaded: DashSet<ModelId>,
    model_locks: DashMap<ModelId, Arc<Mutex<()>>>,
}

impl RemoteEngine {
    /// Connects to the worker and caches its specification, languages and health
    pub async fn connect(base_url: &str, poll_interval: Duration) -> NluResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| NluError::Engine(format!("cannot build HTTP client: {}", e)))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        let info: EngineInfo = get_json(&client, &format!("{}/info", base_url)).await?;

        tracing::info!(
            engine = %base_url,
            nlu_version = %info.specifications.nlu_version,
            languages = ?info.languages,
            "Connected to engine worker"
        );

        Ok(Self {
            client,
            base_url,
            poll_interval,
            info: RwLock::new(info),
            loaded: DashSet::new(),
            model_locks: DashMap::new(),
        })
    }

    /// Re-reads worker info (health changes as language sources come and go)
    pub async fn refresh_info(&self) -> NluResult<()> {
        let info: EngineInfo = get_json(&self.client, &self.url("info")).await?;
        *self.info.write().unwrap_or_else(|e| e.into_inner()) = info;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn cached_info(&self) -> EngineInfo {
        self.info.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn model_lock(&self, model_id: &ModelId) -> Arc<Mutex<()>> {
        self.model_locks
            .entry(model_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> NluResult<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(network_error)?;
        read_json(response).await
    }

    async fn post_empty<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> NluResult<StatusCode> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(status);
        }
        let text = response.text().await.unwrap_or_default();
        Err(NluError::Engine(format!("engine returned {}: {}", status, text)))
    }
}

#[async_trait]
impl Engine for RemoteEngine {
    fn specifications(&self) -> Specifications {
        self.cached_info().specifications
    }

    fn languages(&self) -> Vec<LanguageCode> {
        self.cached_info().languages
    }

    fn health(&self) -> Health {
        self.cached_info().health
    }

    async fn train(
        &self,
        session_key: &str,
        train_set: TrainSet,
        options: TrainingOptions,
    ) -> NluResult<Model> {
        let body = StartTrainingBody {
            key: session_key,
            train_set: &train_set,
            previous_model: options.previous_model.as_ref(),
        };
        if self.post_empty("train", &body).await? == StatusCode::CONFLICT {
            return Err(NluError::TrainingAlreadyStarted {
                key: session_key.to_string(),
            });
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;

            let status: RemoteTrainingStatus =
                get_json(&self.client, &self.url(&format!("train/{}", session_key))).await?;

            tracing::debug!(key = %session_key, status = ?status.status, progress = status.progress, "Polled training status");

            match status.status {
                RemoteStatus::TrainingPending => {}
                RemoteStatus::Training => (options.progress)(status.progress).await,
                RemoteStatus::Done => {
                    (options.progress)(1.0).await;
                    return status.model.ok_or_else(|| {
                        NluError::Engine(format!("training {} finished without a model", session_key))
                    });
                }
                RemoteStatus::Canceled => return Err(NluError::TrainingCanceled),
                RemoteStatus::Errored => {
                    return Err(NluError::Engine(
                        status
                            .error
                            .unwrap_or_else(|| "Error during training.".to_string()),
                    ));
                }
            }
        }
    }

    async fn cancel_training(&self, session_key: &str) -> NluResult<()> {
        self.post_empty(&format!("train/{}/cancel", session_key), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn load_model(&self, model: Model) -> NluResult<()> {
        let lock = self.model_lock(&model.id);
        let _guard = lock.lock().await;

        self.post_empty("models", &model).await?;
        self.loaded.insert(model.id.clone());
        tracing::debug!(model_id = %model.id, "Model loaded in engine");
        Ok(())
    }

    async fn unload_model(&self, model_id: &ModelId) -> NluResult<()> {
        let lock = self.model_lock(model_id);
        let _guard = lock.lock().await;

        let response = self
            .client
            .delete(self.url(&format!("models/{}", model_id)))
            .send()
            .await
            .map_err(network_error)?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(NluError::Engine(format!(
                "engine refused to unload {}: {}",
                model_id,
                response.status()
            )));
        }
        self.loaded.remove(model_id);
        Ok(())
    }

    fn has_model(&self, model_id: &ModelId) -> bool {
        self.loaded.contains(model_id)
    }

    async fn detect_language(
        &self,
        text: &str,
        models: &ModelsByLanguage,
    ) -> NluResult<Option<LanguageCode>> {
        let response: DetectResponse = self
            .post_json("detect-lang", &DetectBody { text, models })
            .await?;
        Ok(response.language)
    }

    async fn predict(&self, text: &str, model_id: &ModelId) -> NluResult<Prediction> {
        self.post_json(&format!("predict/{}", model_id), &TextBody { text })
            .await
    }

    async fn spell_check(&self, text: &str, model_id: &ModelId) -> NluResult<String> {
        let response: SpellCheckResponse = self
            .post_json(&format!("spellcheck/{}", model_id), &TextBody { text })
            .await?;
        Ok(response.spell_checked)
    }
}

async fn get_json<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> NluResult<T> {
    let response = client.get(url).send().await.map_err(network_error)?;
    read_json(response).await
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> NluResult<T> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(NluError::Engine(format!("engine returned {}: {}", status, text)));
    }
    response
        .json()
        .await
        .map_err(|e| NluError::Engine(format!("unreadable engine response: {}", e)))
}

fn network_error(err: reqwest::Error) -> NluError {
    NluError::Engine(format!("engine unreachable: {}", err))
}
