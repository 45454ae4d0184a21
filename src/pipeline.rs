//! Prediction pipeline
//!
//! Detects the language of an utterance, walks the candidate languages
//! (`detected`, `anticipated`, `default`), hot-loads missing models from the
//! repository and merges the prediction of the spell-checked text into the
//! prediction of the original text.

use crate::engine::{ContextPrediction, Engine, IntentPrediction, Model, Prediction};
use crate::error::{NluError, NluResult};
use crate::language::{LanguageCode, ModelsByLanguage};
use crate::metrics;
use crate::model_id::{BriefFactors, BriefId, ModelId};
use crate::repository::ModelRepository;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Prediction served in `language`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Understanding {
    pub detected_language: Option<LanguageCode>,
    pub language: LanguageCode,
    pub spell_checked: Option<String>,
    pub ms: f64,
    #[serde(flatten)]
    pub prediction: Prediction,
}

pub struct PredictRequest<'a> {
    pub text: &'a str,
    pub anticipated_language: Option<&'a LanguageCode>,
    pub default_language: &'a LanguageCode,
    pub secret: &'a str,
}

enum Attempt {
    /// No model could be found or loaded for the language
    Skipped,
    Errored,
    Served(Understanding),
}

pub struct PredictionPipeline {
    engine: Arc<dyn Engine>,
    repository: Arc<ModelRepository>,
}

impl PredictionPipeline {
    pub fn new(engine: Arc<dyn Engine>, repository: Arc<ModelRepository>) -> Self {
        Self { engine, repository }
    }

    /// Predicts `request.text`, recording in `models` any model hot-loaded on the way
    pub async fn predict(
        &self,
        request: PredictRequest<'_>,
        models: &mut ModelsByLanguage,
    ) -> NluResult<Understanding> {
        let (loaded, missing): (ModelsByLanguage, ModelsByLanguage) = models
            .iter()
            .map(|(lang, id)| (lang.clone(), id.clone()))
            .partition(|(_, id)| self.engine.has_model(id));

        if !missing.is_empty() {
            tracing::warn!(
                missing = ?missing.values().map(ToString::to_string).collect::<Vec<_>>(),
                "About to detect language, but some models are not loaded"
            );
        }

        let detected_language = match self.engine.detect_language(request.text, &loaded).await {
            Ok(lang) => lang,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    default_language = %request.default_language,
                    "Language detection failed, falling back on candidate languages"
                );
                None
            }
        };

        let candidates = candidate_languages(
            detected_language.as_ref(),
            request.anticipated_language,
            request.default_language,
        );

        for language in &candidates {
            match self
                .try_predict_in(request.text, language, request.secret, models)
                .await
            {
                Attempt::Served(mut understanding) if !understanding.prediction.contexts.is_empty() => {
                    understanding.detected_language = detected_language;
                    metrics::record_prediction(language.as_str(), understanding.ms);
                    return Ok(understanding);
                }
                _ => metrics::record_prediction_fallback(language.as_str()),
            }
        }

        Err(NluError::NoModelForLanguages {
            languages: candidates.iter().map(ToString::to_string).collect(),
        })
    }

    async fn try_predict_in(
        &self,
        text: &str,
        language: &LanguageCode,
        secret: &str,
        models: &mut ModelsByLanguage,
    ) -> Attempt {
        let loaded_id = models
            .get(language)
            .filter(|id| self.engine.has_model(id))
            .cloned();

        let model_id = match loaded_id {
            Some(id) => id,
            None => match self.fetch_model(language, models, secret).await {
                Some(model) => {
                    let id = model.id.clone();
                    if let Err(e) = self.engine.load_model(model).await {
                        tracing::error!(model_id = %id, error = %e, "Could not load model");
                        return Attempt::Skipped;
                    }
                    models.insert(language.clone(), id.clone());
                    id
                }
                None => return Attempt::Skipped,
            },
        };

        let spell_checked = match self.engine.spell_check(text, &model_id).await {
            Ok(corrected) => Some(corrected),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    text = %text,
                    "Spell checking failed, falling back on original input"
                );
                None
            }
        };

        let started = Instant::now();
        let result = self
            .predict_with_correction(text, spell_checked.as_deref(), &model_id)
            .await;
        let ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(prediction) => Attempt::Served(Understanding {
                detected_language: None,
                language: language.clone(),
                spell_checked,
                ms,
                prediction,
            }),
            Err(e) => {
                tracing::error!(
                    model_id = %model_id,
                    error = %e,
                    text = %text,
                    "Prediction failed"
                );
                Attempt::Errored
            }
        }
    }

    async fn predict_with_correction(
        &self,
        text: &str,
        spell_checked: Option<&str>,
        model_id: &ModelId,
    ) -> NluResult<Prediction> {
        let original = self.engine.predict(text, model_id).await?;

        match spell_checked {
            Some(corrected) if corrected != text => {
                let corrected = self.engine.predict(corrected, model_id).await?;
                Ok(merge_spell_checked(original, corrected))
            }
            _ => Ok(original),
        }
    }

    /// Model recorded for `language`, else the latest one trained by the current engine
    async fn fetch_model(
        &self,
        language: &LanguageCode,
        models: &ModelsByLanguage,
        secret: &str,
    ) -> Option<Model> {
        let specifications = self.engine.specifications();

        let found = match models.get(language) {
            Some(id) => self.repository.get_model(id, secret).await,
            None => {
                let brief = BriefId::from_factors(BriefFactors {
                    language: Some(language),
                    specifications: Some(&specifications),
                    ..Default::default()
                });
                self.repository.latest_model(&brief, secret).await
            }
        };

        let model = match found {
            Ok(model) => model?,
            Err(e) => {
                tracing::error!(language = %language, error = %e, "Could not read model repository");
                return None;
            }
        };

        // A model trained by another engine version cannot be served by this one
        let current = BriefId::from_factors(BriefFactors {
            specifications: Some(&specifications),
            ..Default::default()
        });
        if !current.matches(&model.id) {
            tracing::warn!(
                model_id = %model.id,
                "Refusing to load a model trained with other engine specifications"
            );
            return None;
        }

        Some(model)
    }
}

/// `[detected, anticipated, default]` without absent values or repeats
pub fn candidate_languages(
    detected: Option<&LanguageCode>,
    anticipated: Option<&LanguageCode>,
    default: &LanguageCode,
) -> Vec<LanguageCode> {
    let mut candidates: Vec<LanguageCode> = Vec::with_capacity(3);
    for lang in [detected, anticipated, Some(default)].into_iter().flatten() {
        if !candidates.contains(lang) {
            candidates.push(lang.clone());
        }
    }
    candidates
}

/// Merges the prediction of the spell-corrected text into the original one.
///
/// Contexts and intents keep the more confident of the two readings; entities
/// only found in the corrected text are added.
pub fn merge_spell_checked(original: Prediction, corrected: Prediction) -> Prediction {
    let mut merged = original;

    for ctx in corrected.contexts {
        match merged.contexts.iter_mut().find(|c| c.name == ctx.name) {
            Some(existing) => merge_context(existing, ctx),
            None => merged.contexts.push(ctx),
        }
    }

    for entity in corrected.entities {
        let known = merged
            .entities
            .iter()
            .any(|e| e.name == entity.name && e.value == entity.value);
        if !known {
            merged.entities.push(entity);
        }
    }

    merged
}

fn merge_context(existing: &mut ContextPrediction, corrected: ContextPrediction) {
    if corrected.confidence > existing.confidence {
        existing.confidence = corrected.confidence;
        existing.oos = corrected.oos;
    }

    for intent in corrected.intents {
        match existing.intents.iter_mut().find(|i| i.name == intent.name) {
            Some(known) if intent.confidence > known.confidence => *known = intent,
            Some(_) => {}
            None => existing.intents.push(intent),
        }
    }

    existing
        .intents
        .sort_by(|a: &IntentPrediction, b: &IntentPrediction| b.confidence.total_cmp(&a.confidence));
}
