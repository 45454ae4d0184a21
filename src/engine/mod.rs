//! NLU engine interface
//!
//! The engine owns tokenization, classification and slot extraction, and the set
//! of models currently loaded in memory. Everything in this crate talks to it
//! through the [`Engine`] trait:
//! - [`remote::RemoteEngine`] drives an engine worker process over HTTP
//! - [`mock::MockEngine`] is a deterministic in-process engine for tests and local runs

pub mod mock;
pub mod remote;

use crate::definitions::TrainSet;
use crate::error::NluResult;
use crate::language::{LanguageCode, ModelsByLanguage};
use crate::model_id::ModelId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

pub use mock::MockEngine;
pub use remote::RemoteEngine;

/// Engine version and runtime description; hashed into every [`ModelId`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Specifications {
    pub nlu_version: String,
    pub language_server: LanguageServerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageServerSpec {
    pub dimensions: u32,
    pub domain: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub is_enabled: bool,
    pub valid_providers_count: u32,
    pub valid_languages: Vec<LanguageCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub specifications: Specifications,
    pub languages: Vec<LanguageCode>,
    pub health: Health,
}

/// Opaque engine payload of a trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelData {
    pub input: String,
    pub output: String,
}

/// Trained model artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: ModelId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub data: ModelData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPrediction {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: serde_json::Value,
    pub confidence: f64,
    pub source: String,
    pub start: usize,
    pub end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotPrediction {
    pub name: String,
    pub value: serde_json::Value,
    pub confidence: f64,
    pub source: String,
    pub start: usize,
    pub end: usize,
    pub entity: Option<EntityPrediction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentPrediction {
    pub name: String,
    pub confidence: f64,
    pub slots: Vec<SlotPrediction>,
    pub extractor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPrediction {
    pub name: String,
    pub oos: f64,
    pub confidence: f64,
    pub intents: Vec<IntentPrediction>,
}

/// Raw engine output for a single utterance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub entities: Vec<EntityPrediction>,
    pub contexts: Vec<ContextPrediction>,
}

impl Prediction {
    /// Rounds every confidence to three decimals
    pub fn rounded(mut self) -> Self {
        for entity in &mut self.entities {
            entity.confidence = round3(entity.confidence);
        }
        for ctx in &mut self.contexts {
            ctx.confidence = round3(ctx.confidence);
            ctx.oos = round3(ctx.oos);
            for intent in &mut ctx.intents {
                intent.confidence = round3(intent.confidence);
                for slot in &mut intent.slots {
                    slot.confidence = round3(slot.confidence);
                }
            }
        }
        self
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Receives training progress in [0, 1]
pub type ProgressCallback = Arc<dyn Fn(f64) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn progress_callback<F, Fut>(f: F) -> ProgressCallback
where
    F: Fn(f64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |p| Box::pin(f(p)))
}

pub fn noop_progress() -> ProgressCallback {
    progress_callback(|_| async {})
}

#[derive(Clone)]
pub struct TrainingOptions {
    pub progress: ProgressCallback,
    pub previous_model: Option<ModelId>,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            progress: noop_progress(),
            previous_model: None,
        }
    }
}

/// Capability consumed by the training service and the prediction pipeline.
///
/// Implementations serialize `load_model` / `unload_model` per model id.
#[async_trait]
pub trait Engine: Send + Sync {
    fn specifications(&self) -> Specifications;

    fn languages(&self) -> Vec<LanguageCode>;

    fn health(&self) -> Health;

    /// Trains a model. Fails with `TrainingCanceled` after a cooperative cancel and
    /// with `TrainingAlreadyStarted` if `session_key` is already training.
    async fn train(
        &self,
        session_key: &str,
        train_set: TrainSet,
        options: TrainingOptions,
    ) -> NluResult<Model>;

    async fn cancel_training(&self, session_key: &str) -> NluResult<()>;

    async fn load_model(&self, model: Model) -> NluResult<()>;

    async fn unload_model(&self, model_id: &ModelId) -> NluResult<()>;

    fn has_model(&self, model_id: &ModelId) -> bool;

    /// Detects the language of `text` among the languages of `models`
    async fn detect_language(
        &self,
        text: &str,
        models: &ModelsByLanguage,
    ) -> NluResult<Option<LanguageCode>>;

    async fn predict(&self, text: &str, model_id: &ModelId) -> NluResult<Prediction>;

    async fn spell_check(&self, text: &str, model_id: &ModelId) -> NluResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_rounding() {
        let prediction = Prediction {
            entities: vec![],
            contexts: vec![ContextPrediction {
                name: "global".into(),
                oos: 0.12345,
                confidence: 0.98765,
                intents: vec![IntentPrediction {
                    name: "hello".into(),
                    confidence: 0.33333,
                    slots: vec![],
                    extractor: "classifier".into(),
                }],
            }],
        }
        .rounded();

        assert_eq!(prediction.contexts[0].oos, 0.123);
        assert_eq!(prediction.contexts[0].confidence, 0.988);
        assert_eq!(prediction.contexts[0].intents[0].confidence, 0.333);
    }

    #[tokio::test]
    async fn test_progress_callback_invokes_closure() {
        let seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen_clone = seen.clone();
        let cb = progress_callback(move |p| {
            let seen = seen_clone.clone();
            async move {
                seen.store((p * 100.0) as u64, std::sync::atomic::Ordering::SeqCst);
            }
        });
        cb(0.5).await;
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 50);
    }
}
