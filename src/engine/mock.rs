//! Deterministic in-process engine
//!
//! Scores utterances by word overlap against the training utterances stored in
//! the model payload. Behavior can be steered (slow trainings, failing languages,
//! forced language detection, spelling corrections) so the orchestration layers
//! can be exercised without a real inference backend.

use super::{
    ContextPrediction, Engine, EntityPrediction, Health, IntentPrediction, LanguageServerSpec,
    Model, ModelData, Prediction, Specifications, TrainingOptions,
};
use crate::definitions::{EntityDefinition, TrainSet};
use crate::error::{NluError, NluResult};
use crate::language::{LanguageCode, ModelsByLanguage};
use crate::model_id::ModelId;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcome forced on `detect_language`
#[derive(Debug, Clone)]
pub enum Detection {
    /// Single candidate model wins, otherwise undetermined
    Auto,
    Language(LanguageCode),
    Fail,
}

pub struct MockEngine {
    specifications: Specifications,
    languages: Vec<LanguageCode>,
    steps: u32,
    step_delay: Duration,
    loaded: DashMap<ModelId, Model>,
    trainings: DashMap<String, Arc<AtomicBool>>,
    train_failures: DashSet<LanguageCode>,
    predict_failures: DashSet<LanguageCode>,
    corrections: DashMap<String, String>,
    detection: Mutex<Detection>,
    train_calls: AtomicUsize,
    load_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockEngine {
    pub fn new(languages: &[&str]) -> Self {
        Self {
            specifications: Specifications {
                nlu_version: "1.0.0".to_string(),
                language_server: LanguageServerSpec {
                    dimensions: 300,
                    domain: "mock".to_string(),
                    version: "1.0.0".to_string(),
                },
            },
            languages: languages.iter().filter_map(|l| l.parse().ok()).collect(),
            steps: 4,
            step_delay: Duration::from_millis(10),
            loaded: DashMap::new(),
            trainings: DashMap::new(),
            train_failures: DashSet::new(),
            predict_failures: DashSet::new(),
            corrections: DashMap::new(),
            detection: Mutex::new(Detection::Auto),
            train_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Each training reports `steps` progress updates, `step_delay` apart
    pub fn with_training_steps(mut self, steps: u32, step_delay: Duration) -> Self {
        self.steps = steps.max(1);
        self.step_delay = step_delay;
        self
    }

    pub fn with_specifications(mut self, specifications: Specifications) -> Self {
        self.specifications = specifications;
        self
    }

    pub fn fail_training_for(&self, language: &str) {
        if let Ok(lang) = language.parse() {
            self.train_failures.insert(lang);
        }
    }

    pub fn fail_prediction_for(&self, language: &str) {
        if let Ok(lang) = language.parse() {
            self.predict_failures.insert(lang);
        }
    }

    pub fn add_correction(&self, text: &str, corrected: &str) {
        self.corrections
            .insert(text.to_string(), corrected.to_string());
    }

    pub fn set_detection(&self, detection: Detection) {
        *self.detection.lock().unwrap_or_else(|e| e.into_inner()) = detection;
    }

    pub fn train_calls(&self) -> usize {
        self.train_calls.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Highest number of trainings observed running at the same time
    pub fn max_concurrent_trainings(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active_trainings(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn loaded_models(&self) -> Vec<ModelId> {
        self.loaded.iter().map(|e| e.key().clone()).collect()
    }

    async fn run_training(
        &self,
        train_set: TrainSet,
        options: TrainingOptions,
        canceled: &AtomicBool,
    ) -> NluResult<Model> {
        let started_at = chrono::Utc::now();
        let language = train_set.language.clone();

        for step in 1..=self.steps {
            tokio::time::sleep(self.step_delay).await;
            if canceled.load(Ordering::SeqCst) {
                return Err(NluError::TrainingCanceled);
            }
            (options.progress)(f64::from(step) / f64::from(self.steps)).await;
        }

        if self.train_failures.contains(&language) {
            return Err(NluError::Engine(format!(
                "training failed for language {}",
                language
            )));
        }

        let id = ModelId::make(&train_set, &self.specifications);
        let input = serde_json::to_string(&train_set)
            .map_err(|e| NluError::Engine(format!("cannot serialize train set: {}", e)))?;

        Ok(Model {
            id,
            started_at,
            finished_at: chrono::Utc::now(),
            data: ModelData {
                input,
                output: "mock".to_string(),
            },
        })
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn specifications(&self) -> Specifications {
        self.specifications.clone()
    }

    fn languages(&self) -> Vec<LanguageCode> {
        self.languages.clone()
    }

    fn health(&self) -> Health {
        Health {
            is_enabled: true,
            valid_providers_count: 1,
            valid_languages: self.languages.clone(),
        }
    }

    async fn train(
        &self,
        session_key: &str,
        train_set: TrainSet,
        options: TrainingOptions,
    ) -> NluResult<Model> {
        let canceled = match self.trainings.entry(session_key.to_string()) {
            Entry::Occupied(_) => {
                return Err(NluError::TrainingAlreadyStarted {
                    key: session_key.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                let flag = Arc::new(AtomicBool::new(false));
                slot.insert(flag.clone());
                flag
            }
        };

        self.train_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = self.run_training(train_set, options, &canceled).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.trainings.remove(session_key);
        result
    }

    async fn cancel_training(&self, session_key: &str) -> NluResult<()> {
        if let Some(flag) = self.trainings.get(session_key) {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn load_model(&self, model: Model) -> NluResult<()> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.loaded.insert(model.id.clone(), model);
        Ok(())
    }

    async fn unload_model(&self, model_id: &ModelId) -> NluResult<()> {
        self.loaded.remove(model_id);
        Ok(())
    }

    fn has_model(&self, model_id: &ModelId) -> bool {
        self.loaded.contains_key(model_id)
    }

    async fn detect_language(
        &self,
        _text: &str,
        models: &ModelsByLanguage,
    ) -> NluResult<Option<LanguageCode>> {
        let detection = self
            .detection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match detection {
            Detection::Language(lang) => Ok(Some(lang)),
            Detection::Fail => Err(NluError::Engine("language detection failed".to_string())),
            Detection::Auto if models.len() == 1 => Ok(models.keys().next().cloned()),
            Detection::Auto => Ok(None),
        }
    }

    async fn predict(&self, text: &str, model_id: &ModelId) -> NluResult<Prediction> {
        if self.predict_failures.contains(&model_id.language_code) {
            return Err(NluError::Engine(format!(
                "prediction failed for model {}",
                model_id
            )));
        }

        let model = self
            .loaded
            .get(model_id)
            .map(|m| m.value().clone())
            .ok_or_else(|| NluError::Engine(format!("model {} is not loaded", model_id)))?;

        let train_set: TrainSet = serde_json::from_str(&model.data.input)
            .map_err(|e| NluError::Engine(format!("unreadable model payload: {}", e)))?;

        Ok(score(text, &train_set))
    }

    async fn spell_check(&self, text: &str, _model_id: &ModelId) -> NluResult<String> {
        Ok(self
            .corrections
            .get(text)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| text.to_string()))
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect()
}

fn overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let common = a.intersection(b).count() as f64;
    common / a.union(b).count() as f64
}

fn score(text: &str, train_set: &TrainSet) -> Prediction {
    let input = words(text);
    let mut by_context: BTreeMap<String, Vec<IntentPrediction>> = BTreeMap::new();

    for intent in &train_set.intents {
        let confidence = intent
            .utterances
            .iter()
            .map(|u| overlap(&input, &words(u)))
            .fold(0.0, f64::max);

        for ctx in &intent.contexts {
            by_context.entry(ctx.clone()).or_default().push(IntentPrediction {
                name: intent.name.clone(),
                confidence,
                slots: vec![],
                extractor: "mock".to_string(),
            });
        }
    }

    let contexts = by_context
        .into_iter()
        .map(|(name, mut intents)| {
            intents.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            let confidence = intents.first().map(|i| i.confidence).unwrap_or(0.0);
            ContextPrediction {
                name,
                oos: 1.0 - confidence,
                confidence,
                intents,
            }
        })
        .collect();

    let lowered = text.to_lowercase();
    let mut entities = Vec::new();
    for entity in &train_set.entities {
        if let EntityDefinition::List { name, values, .. } = entity {
            for value in values {
                let candidates = std::iter::once(&value.name).chain(value.synonyms.iter());
                for candidate in candidates {
                    let needle = candidate.to_lowercase();
                    if let Some(start) = lowered.find(&needle) {
                        let end = start + needle.len();
                        entities.push(EntityPrediction {
                            name: name.clone(),
                            entity_type: format!("custom.list.{}", name),
                            value: serde_json::Value::String(value.name.clone()),
                            confidence: 1.0,
                            source: lowered[start..end].to_string(),
                            start,
                            end,
                            unit: None,
                        });
                        break;
                    }
                }
            }
        }
    }

    Prediction { entities, contexts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::fixtures::*;
    use crate::engine::progress_callback;

    fn train_set() -> TrainSet {
        let defs = sales_definitions();
        TrainSet {
            intents: defs.intents,
            entities: vec![city_enum()],
            language: "en".parse().unwrap(),
            seed: 1,
        }
    }

    #[tokio::test]
    async fn test_train_reports_progress_and_returns_model() {
        let engine = MockEngine::new(&["en"]).with_training_steps(3, Duration::from_millis(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let options = TrainingOptions {
            progress: progress_callback(move |p| {
                let seen = seen_clone.clone();
                async move {
                    seen.lock().unwrap().push(p);
                }
            }),
            previous_model: None,
        };

        let model = engine.train("k", train_set(), options).await.unwrap();
        assert_eq!(model.id, ModelId::make(&train_set(), &engine.specifications()));
        assert_eq!(seen.lock().unwrap().last().copied(), Some(1.0));
        assert_eq!(engine.train_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_training() {
        let engine = Arc::new(MockEngine::new(&["en"]).with_training_steps(50, Duration::from_millis(5)));
        let e = engine.clone();
        let handle = tokio::spawn(async move { e.train("k", train_set(), TrainingOptions::default()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.cancel_training("k").await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(NluError::TrainingCanceled)));
    }

    #[tokio::test]
    async fn test_same_key_already_started() {
        let engine = Arc::new(MockEngine::new(&["en"]).with_training_steps(20, Duration::from_millis(5)));
        let e = engine.clone();
        let first = tokio::spawn(async move { e.train("k", train_set(), TrainingOptions::default()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = engine.train("k", train_set(), TrainingOptions::default()).await;
        assert!(matches!(second, Err(NluError::TrainingAlreadyStarted { .. })));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_predict_scores_best_intent() {
        let engine = MockEngine::new(&["en"]).with_training_steps(1, Duration::from_millis(1));
        let model = engine.train("k", train_set(), TrainingOptions::default()).await.unwrap();
        let id = model.id.clone();
        engine.load_model(model).await.unwrap();

        let prediction = engine.predict("i want to buy in paris", &id).await.unwrap();
        let sales = &prediction.contexts[0];
        assert_eq!(sales.name, "sales");
        assert_eq!(sales.intents[0].name, "buy");
        assert_eq!(prediction.entities[0].name, "city");
    }

    #[tokio::test]
    async fn test_predict_requires_loaded_model() {
        let engine = MockEngine::new(&["en"]);
        let id = ModelId::make(&train_set(), &engine.specifications());
        assert!(engine.predict("hello", &id).await.is_err());
    }
}
