//! A mounted tenant
//!
//! Trains its languages through the [`NluService`] on behalf of the training
//! queue and serves predictions through the [`PredictionPipeline`].

use crate::config::BotConfig;
use crate::definitions::{TrainInput, TrainSet, TrainingDefinitions, assert_train_input};
use crate::engine::ProgressCallback;
use crate::error::{NluError, NluResult};
use crate::language::{LanguageCode, ModelsByLanguage};
use crate::model_id::ModelId;
use crate::pipeline::{PredictRequest, PredictionPipeline, Understanding};
use crate::queue::{CancelSignal, Trainer};
use crate::service::{MAX_SEED, NluService};
use crate::sessions::TrainingStatus;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;

/// Public view of a mounted bot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotInfo {
    pub bot_id: String,
    pub default_language: LanguageCode,
    pub languages: Vec<LanguageCode>,
    pub models: ModelsByLanguage,
}

pub struct Bot {
    config: BotConfig,
    /// Configured languages the engine supports
    languages: Vec<LanguageCode>,
    service: Arc<NluService>,
    pipeline: Arc<PredictionPipeline>,
    poll_interval: Duration,
    /// Models currently serving predictions
    models_by_lang: RwLock<ModelsByLanguage>,
    /// Most recent model trained or found for each language
    latest_by_lang: DashMap<LanguageCode, ModelId>,
}

impl Bot {
    pub fn new(
        config: BotConfig,
        languages: Vec<LanguageCode>,
        service: Arc<NluService>,
        pipeline: Arc<PredictionPipeline>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            config,
            languages,
            service,
            pipeline,
            poll_interval,
            models_by_lang: RwLock::new(ModelsByLanguage::new()),
            latest_by_lang: DashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.bot_id
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn languages(&self) -> &[LanguageCode] {
        &self.languages
    }

    pub fn speaks(&self, language: &LanguageCode) -> bool {
        self.languages.contains(language)
    }

    /// Configured seed, else one derived from the bot id so retrains hit the cache
    pub fn seed(&self) -> i64 {
        if let Some(seed) = self.config.seed {
            return seed;
        }
        let digest = Sha256::digest(self.config.bot_id.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(bytes) % (MAX_SEED as u64 + 1)) as i64
    }

    pub fn definitions(&self, language: &LanguageCode) -> TrainingDefinitions {
        self.config
            .definitions
            .get(language)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn models(&self) -> ModelsByLanguage {
        self.models_by_lang.read().await.clone()
    }

    pub async fn info(&self) -> BotInfo {
        BotInfo {
            bot_id: self.config.bot_id.clone(),
            default_language: self.config.default_language.clone(),
            languages: self.languages.clone(),
            models: self.models().await,
        }
    }

    fn train_input(&self, language: &LanguageCode) -> NluResult<TrainInput> {
        if !self.speaks(language) {
            return Err(NluError::Precondition(format!(
                "Bot {} doesn't support language {}",
                self.config.bot_id, language
            )));
        }
        Ok(TrainInput::from_definitions(
            &self.definitions(language),
            language,
            &self.config.password,
            self.seed(),
        ))
    }

    /// Id of the model the current definitions of `language` produce
    pub fn model_id_for(&self, language: &LanguageCode) -> NluResult<ModelId> {
        let input = self.train_input(language)?;
        let language = assert_train_input(&input)?;
        let train_set = TrainSet {
            intents: input.intents,
            entities: input.entities,
            language,
            seed: self.seed(),
        };
        Ok(ModelId::make(
            &train_set,
            &self.service.engine().specifications(),
        ))
    }

    /// Loads every language whose model already exists.
    ///
    /// Returns the languages that still need training.
    pub async fn mount(&self) -> NluResult<Vec<LanguageCode>> {
        let mut needs_training = Vec::new();

        for language in &self.languages {
            let model_id = self.model_id_for(language)?;
            if !self.service.has_model(&model_id, &self.config.password).await? {
                needs_training.push(language.clone());
                continue;
            }

            self.latest_by_lang.insert(language.clone(), model_id);
            if let Err(e) = self.load_latest(language).await {
                tracing::warn!(
                    bot_id = %self.config.bot_id,
                    language = %language,
                    error = %e,
                    "Could not load existing model"
                );
                needs_training.push(language.clone());
            }
        }

        tracing::info!(
            bot_id = %self.config.bot_id,
            languages = self.languages.len(),
            needs_training = needs_training.len(),
            "Bot mounted"
        );
        Ok(needs_training)
    }

    /// Predicts `text`, keeping every model the pipeline hot-loads on the way
    pub async fn predict(
        &self,
        text: &str,
        anticipated_language: Option<&LanguageCode>,
    ) -> NluResult<Understanding> {
        let mut models = self.models().await;

        let result = self
            .pipeline
            .predict(
                PredictRequest {
                    text,
                    anticipated_language,
                    default_language: &self.config.default_language,
                    secret: &self.config.password,
                },
                &mut models,
            )
            .await;

        let mut current = self.models_by_lang.write().await;
        for (language, model_id) in models {
            current.entry(language).or_insert(model_id);
        }

        result
    }

    async fn poll_training(
        &self,
        model_id: &ModelId,
        cancel: &CancelSignal,
        progress: &ProgressCallback,
    ) -> NluResult<()> {
        let password = &self.config.password;
        let mut ticker = interval(self.poll_interval);
        let mut cancel_sent = false;

        loop {
            ticker.tick().await;
            let session = self.service.training_status(model_id, password).await?;

            match session.status {
                TrainingStatus::Done => return Ok(()),
                TrainingStatus::Canceled => return Err(NluError::TrainingCanceled),
                TrainingStatus::Errored => {
                    return Err(NluError::Engine(format!(
                        "Training of model {} errored",
                        model_id
                    )));
                }
                TrainingStatus::Training => progress(session.progress).await,
                _ => {}
            }

            if cancel.is_canceled() && !cancel_sent {
                // Only a training the engine already runs can be canceled; retried next tick
                match self.service.cancel_training(model_id, password).await {
                    Ok(()) => cancel_sent = true,
                    Err(NluError::TrainingNotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

#[async_trait]
impl Trainer for Bot {
    async fn train(
        &self,
        language: &LanguageCode,
        progress: ProgressCallback,
        cancel: CancelSignal,
    ) -> NluResult<ModelId> {
        let input = self.train_input(language)?;
        if cancel.is_canceled() {
            return Err(NluError::TrainingCanceled);
        }

        let model_id = self.service.start_training(input).await?;
        if let Err(e) = self.poll_training(&model_id, &cancel, &progress).await {
            if e.is_training_canceled() {
                tracing::info!(bot_id = %self.config.bot_id, language = %language, "Training canceled");
            }
            return Err(e);
        }

        self.latest_by_lang.insert(language.clone(), model_id.clone());
        Ok(model_id)
    }

    async fn load_latest(&self, language: &LanguageCode) -> NluResult<()> {
        let model_id = match self.latest_by_lang.get(language) {
            Some(id) => id.value().clone(),
            None => self.model_id_for(language)?,
        };

        let engine = self.service.engine();
        if !engine.has_model(&model_id) {
            let model = self
                .service
                .repository()
                .get_model(&model_id, &self.config.password)
                .await?
                .ok_or_else(|| NluError::ModelNotFound {
                    model_id: model_id.to_string(),
                })?;
            engine.load_model(model).await?;
        }

        tracing::info!(
            bot_id = %self.config.bot_id,
            language = %language,
            model_id = %model_id,
            "Model loaded"
        );
        self.models_by_lang
            .write()
            .await
            .insert(language.clone(), model_id);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::definitions::fixtures::sales_definitions;
    use std::collections::BTreeMap;

    pub fn bot_config(bot_id: &str, languages: &[&str]) -> BotConfig {
        let languages: Vec<LanguageCode> = languages.iter().map(|l| l.parse().unwrap()).collect();
        let definitions: BTreeMap<LanguageCode, TrainingDefinitions> = languages
            .iter()
            .map(|l| (l.clone(), sales_definitions()))
            .collect();

        BotConfig {
            bot_id: bot_id.to_string(),
            default_language: languages[0].clone(),
            languages,
            password: "Caput Draconis".to_string(),
            seed: Some(42),
            definitions,
            created_at: None,
        }
    }
}
