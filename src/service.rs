//! Training and prediction service behind the v1 HTTP routes
//!
//! Validates training inputs, deduplicates trainings through the model
//! repository, runs accepted trainings in the background and serves batch
//! predictions against a single model.

use crate::definitions::{TrainInput, TrainSet, assert_train_input};
use crate::engine::{
    Engine, EngineInfo, Prediction, TrainingOptions, progress_callback,
};
use crate::error::{NluError, NluResult};
use crate::language::{LanguageCode, ModelsByLanguage};
use crate::metrics;
use crate::model_id::ModelId;
use crate::pipeline::merge_spell_checked;
use crate::repository::ModelRepository;
use crate::sessions::{TrainSessionStore, TrainingSession, TrainingStatus, session_key};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Upper bound of generated seeds
pub const MAX_SEED: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtterancePrediction {
    pub detected_language: Option<LanguageCode>,
    pub spell_checked: String,
    #[serde(flatten)]
    pub prediction: Prediction,
}

pub struct NluService {
    engine: Arc<dyn Engine>,
    repository: Arc<ModelRepository>,
    sessions: Arc<TrainSessionStore>,
    /// Max utterances per request, 0 for unbounded
    batch_size: usize,
}

impl NluService {
    pub fn new(
        engine: Arc<dyn Engine>,
        repository: Arc<ModelRepository>,
        sessions: Arc<TrainSessionStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            engine,
            repository,
            sessions,
            batch_size,
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn repository(&self) -> &Arc<ModelRepository> {
        &self.repository
    }

    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            specifications: self.engine.specifications(),
            languages: self.engine.languages(),
            health: self.engine.health(),
        }
    }

    /// Validates `input` and returns the id of the model it produces.
    ///
    /// Training runs in the background; its outcome is only observable through
    /// [`NluService::training_status`].
    pub async fn start_training(self: &Arc<Self>, input: TrainInput) -> NluResult<ModelId> {
        let language = assert_train_input(&input)?;
        if !self.engine.languages().contains(&language) {
            return Err(NluError::Precondition(format!(
                "language \"{}\" is not supported by the engine",
                language
            )));
        }

        let seed = input
            .seed
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..=MAX_SEED));
        let password = input.password;
        let train_set = TrainSet {
            intents: input.intents,
            entities: input.entities,
            language: language.clone(),
            seed,
        };
        let model_id = ModelId::make(&train_set, &self.engine.specifications());

        if self.repository.has_model(&model_id, &password).await? {
            tracing::info!(model_id = %model_id, "Model already trained, skipping training");
            metrics::record_cache_hit(language.as_str());
            return Ok(model_id);
        }

        if let Some(session) = self.sessions.get(&model_id, &password).await
            && !session.status.is_terminal()
        {
            tracing::info!(model_id = %model_id, status = %session.status, "Training already in progress");
            return Ok(model_id);
        }

        let session = self.sessions.make_session(&model_id);
        self.sessions.set(&model_id, &password, session.clone()).await;

        tracing::info!(model_id = %model_id, language = %language, seed, "Training started");
        metrics::record_training_started(language.as_str());

        let service = Arc::clone(self);
        let id = model_id.clone();
        tokio::spawn(async move { service.train(id, train_set, password, session).await });

        Ok(model_id)
    }

    async fn train(
        self: Arc<Self>,
        model_id: ModelId,
        train_set: TrainSet,
        password: String,
        session: TrainingSession,
    ) {
        let key = session_key(&model_id, &password);

        let progress = {
            let sessions = Arc::clone(&self.sessions);
            let model_id = model_id.clone();
            let password = password.clone();
            let session = session.clone();
            progress_callback(move |p| {
                let sessions = Arc::clone(&sessions);
                let model_id = model_id.clone();
                let password = password.clone();
                let session = session.clone().with_status(TrainingStatus::Training, p);
                async move {
                    // A canceled or finished session is never set back to training
                    let current = sessions.get(&model_id, &password).await;
                    if current.is_some_and(|s| !s.status.is_terminal()) {
                        sessions.set(&model_id, &password, session).await;
                    }
                }
            })
        };

        let options = TrainingOptions {
            progress,
            previous_model: None,
        };

        let outcome = match self.engine.train(&key, train_set, options).await {
            Ok(model) => self.repository.save_model(&model, &password).await,
            Err(e) => Err(e),
        };

        let language = model_id.language_code.as_str().to_string();
        let final_session = match outcome {
            Ok(()) => {
                tracing::info!(model_id = %model_id, "Training done");
                metrics::record_training_finished(&language, "done");
                session.with_status(TrainingStatus::Done, 1.0)
            }
            Err(e) if e.is_training_canceled() => {
                tracing::info!(model_id = %model_id, "Training canceled");
                metrics::record_training_finished(&language, "canceled");
                session.with_status(TrainingStatus::Canceled, 0.0)
            }
            Err(e) if e.is_training_already_started() => {
                tracing::info!(model_id = %model_id, "Training already started");
                return;
            }
            Err(e) => {
                tracing::error!(model_id = %model_id, error = %e, "Error during training");
                metrics::record_training_finished(&language, "errored");
                session.with_status(TrainingStatus::Errored, 0.0)
            }
        };

        self.sessions.set(&model_id, &password, final_session).await;
        self.sessions.release(&model_id, &password).await;
    }

    /// Live session, else a finished session for a persisted model
    pub async fn training_status(
        &self,
        model_id: &ModelId,
        password: &str,
    ) -> NluResult<TrainingSession> {
        if let Some(session) = self.sessions.get(model_id, password).await {
            return Ok(session);
        }

        if self.repository.has_model(model_id, password).await? {
            return Ok(self
                .sessions
                .make_session(model_id)
                .with_status(TrainingStatus::Done, 1.0));
        }

        Err(NluError::ModelNotFound {
            model_id: model_id.to_string(),
        })
    }

    /// Cancels a training that is currently running
    pub async fn cancel_training(&self, model_id: &ModelId, password: &str) -> NluResult<()> {
        match self.sessions.get(model_id, password).await {
            Some(session) if session.status == TrainingStatus::Training => {
                self.engine
                    .cancel_training(&session_key(model_id, password))
                    .await
            }
            _ => Err(NluError::TrainingNotFound {
                model_id: model_id.to_string(),
            }),
        }
    }

    /// Loaded in the engine or persisted in the repository
    pub async fn has_model(&self, model_id: &ModelId, password: &str) -> NluResult<bool> {
        if self.engine.has_model(model_id) {
            return Ok(true);
        }
        self.repository.has_model(model_id, password).await
    }

    /// Predicts every utterance with `model_id`, loading it from the repository if needed
    pub async fn predict(
        &self,
        model_id: &ModelId,
        utterances: &[String],
        password: &str,
    ) -> NluResult<Vec<UtterancePrediction>> {
        self.assert_batch_size(utterances.len())?;
        self.ensure_loaded(model_id, password).await?;

        let models: ModelsByLanguage =
            [(model_id.language_code.clone(), model_id.clone())].into_iter().collect();

        let mut predictions = Vec::with_capacity(utterances.len());
        for text in utterances {
            let detected_language = self.detect_one(text, &models).await;
            let started = Instant::now();

            let spell_checked = self.engine.spell_check(text, model_id).await?;
            let original = self.engine.predict(text, model_id).await?;
            let prediction = if spell_checked != *text {
                let corrected = self.engine.predict(&spell_checked, model_id).await?;
                merge_spell_checked(original, corrected)
            } else {
                original
            };

            metrics::record_prediction(
                model_id.language_code.as_str(),
                started.elapsed().as_secs_f64() * 1000.0,
            );
            predictions.push(UtterancePrediction {
                detected_language,
                spell_checked,
                prediction: prediction.rounded(),
            });
        }

        Ok(predictions)
    }

    /// Detects the language of every utterance among the languages of `model_ids`
    pub async fn detect_language(
        &self,
        model_ids: &[ModelId],
        utterances: &[String],
        password: &str,
    ) -> NluResult<Vec<Option<LanguageCode>>> {
        self.assert_batch_size(utterances.len())?;

        let mut models = ModelsByLanguage::new();
        for model_id in model_ids {
            self.ensure_loaded(model_id, password).await?;
            models.insert(model_id.language_code.clone(), model_id.clone());
        }

        let mut languages = Vec::with_capacity(utterances.len());
        for text in utterances {
            languages.push(self.engine.detect_language(text, &models).await?);
        }
        Ok(languages)
    }

    async fn detect_one(&self, text: &str, models: &ModelsByLanguage) -> Option<LanguageCode> {
        match self.engine.detect_language(text, models).await {
            Ok(language) => language,
            Err(e) => {
                tracing::warn!(error = %e, "Language detection failed");
                None
            }
        }
    }

    async fn ensure_loaded(&self, model_id: &ModelId, password: &str) -> NluResult<()> {
        if self.engine.has_model(model_id) {
            return Ok(());
        }

        let model = self
            .repository
            .get_model(model_id, password)
            .await?
            .ok_or_else(|| NluError::ModelNotFound {
                model_id: model_id.to_string(),
            })?;
        self.engine.load_model(model).await
    }

    fn assert_batch_size(&self, size: usize) -> NluResult<()> {
        if self.batch_size > 0 && size > self.batch_size {
            return Err(NluError::Precondition(format!(
                "Batch size of {} is larger than the allowed maximum batch size ({}).",
                size, self.batch_size
            )));
        }
        Ok(())
    }
}
