//! API request and response models

use crate::bot::BotInfo;
use crate::config::BotConfig;
use crate::definitions::TrainingDefinitions;
use crate::engine::EngineInfo;
use crate::language::LanguageCode;
use crate::pipeline::Understanding;
use crate::service::UtterancePrediction;
use crate::sessions::TrainingSession;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub success: bool,
    pub info: EngineInfo,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainResponse {
    pub success: bool,
    pub model_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub success: bool,
    pub session: TrainingSession,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Tenant secret passed in the query string
#[derive(Debug, Default, Deserialize)]
pub struct PasswordQuery {
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub utterances: Vec<String>,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub success: bool,
    pub predictions: Vec<UtterancePrediction>,
}

#[derive(Debug, Deserialize)]
pub struct DetectLanguageRequest {
    pub utterances: Vec<String>,
    /// Model ids whose languages are the candidates
    pub models: Vec<String>,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectLanguageResponse {
    pub success: bool,
    pub detected_languages: Vec<Option<LanguageCode>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub success: bool,
    pub exists: bool,
}

/// Body of `PUT /bots/{bot_id}`; the id comes from the path
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountBotRequest {
    pub default_language: LanguageCode,
    pub languages: Vec<LanguageCode>,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub definitions: BTreeMap<LanguageCode, TrainingDefinitions>,
}

impl MountBotRequest {
    pub fn into_config(self, bot_id: String) -> BotConfig {
        BotConfig {
            bot_id,
            default_language: self.default_language,
            languages: self.languages,
            password: self.password,
            seed: self.seed,
            definitions: self.definitions,
            created_at: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BotResponse {
    pub success: bool,
    pub bot: BotInfo,
}

#[derive(Debug, Serialize)]
pub struct BotListResponse {
    pub success: bool,
    pub bots: Vec<BotInfo>,
}

#[derive(Debug, Deserialize)]
pub struct BotPredictRequest {
    pub text: String,
    #[serde(default)]
    pub language: Option<LanguageCode>,
}

#[derive(Debug, Serialize)]
pub struct BotPredictResponse {
    pub success: bool,
    pub prediction: Understanding,
}
