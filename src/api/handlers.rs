//! API request handlers

use super::extract::{AppJson, AppQuery};
use super::models::{
    BotListResponse, BotPredictRequest, BotPredictResponse, BotResponse, CancelRequest,
    DetectLanguageRequest, DetectLanguageResponse, ExistsResponse, HealthResponse, InfoResponse,
    MountBotRequest, PasswordQuery, PredictRequest, PredictResponse, SessionResponse,
    SuccessResponse, TrainResponse,
};
use super::routes::AppState;
use crate::definitions::TrainInput;
use crate::error::NluResult;
use crate::language::LanguageCode;
use crate::model_id::ModelId;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

/// GET /health - Manager health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /info - Engine specifications, languages and health
pub async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        success: true,
        info: state.service.info(),
    })
}

/// POST /train - Start a training, returns the id of the model it produces
pub async fn start_training(
    State(state): State<AppState>,
    AppJson(input): AppJson<TrainInput>,
) -> NluResult<Json<TrainResponse>> {
    let model_id = state.service.start_training(input).await?;

    Ok(Json(TrainResponse {
        success: true,
        model_id: model_id.to_string(),
    }))
}

/// GET /train/{model_id} - Training session of a model
pub async fn training_status(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    AppQuery(query): AppQuery<PasswordQuery>,
) -> NluResult<Json<SessionResponse>> {
    let model_id: ModelId = model_id.parse()?;
    let session = state
        .service
        .training_status(&model_id, &query.password)
        .await?;

    Ok(Json(SessionResponse {
        success: true,
        session,
    }))
}

/// POST /train/{model_id}/cancel - Cancel a running training
pub async fn cancel_training(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    AppJson(request): AppJson<CancelRequest>,
) -> NluResult<Json<SuccessResponse>> {
    let model_id: ModelId = model_id.parse()?;
    state
        .service
        .cancel_training(&model_id, &request.password)
        .await?;

    Ok(Json(SuccessResponse { success: true }))
}

/// POST /predict/{model_id} - Batch prediction against one model
pub async fn predict(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    AppJson(request): AppJson<PredictRequest>,
) -> NluResult<Json<PredictResponse>> {
    let model_id: ModelId = model_id.parse()?;
    let predictions = state
        .service
        .predict(&model_id, &request.utterances, &request.password)
        .await?;

    Ok(Json(PredictResponse {
        success: true,
        predictions,
    }))
}

/// POST /detect-lang - Batch language detection among the languages of some models
pub async fn detect_language(
    State(state): State<AppState>,
    AppJson(request): AppJson<DetectLanguageRequest>,
) -> NluResult<Json<DetectLanguageResponse>> {
    let model_ids = request
        .models
        .iter()
        .map(|id| id.parse())
        .collect::<NluResult<Vec<ModelId>>>()?;

    let detected_languages = state
        .service
        .detect_language(&model_ids, &request.utterances, &request.password)
        .await?;

    Ok(Json(DetectLanguageResponse {
        success: true,
        detected_languages,
    }))
}

/// GET /exists/{model_id} - Whether a model is loaded or persisted
pub async fn model_exists(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    AppQuery(query): AppQuery<PasswordQuery>,
) -> NluResult<Json<ExistsResponse>> {
    let model_id: ModelId = model_id.parse()?;
    let exists = state.service.has_model(&model_id, &query.password).await?;

    Ok(Json(ExistsResponse {
        success: true,
        exists,
    }))
}

/// GET /bots - List mounted bots
pub async fn list_bots(State(state): State<AppState>) -> Json<BotListResponse> {
    let mut bots = Vec::new();
    for bot in state.registry.list().await {
        bots.push(bot.info().await);
    }
    bots.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));

    Json(BotListResponse {
        success: true,
        bots,
    })
}

/// PUT /bots/{bot_id} - Mount a bot or update its definitions
pub async fn mount_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    AppJson(request): AppJson<MountBotRequest>,
) -> NluResult<Json<BotResponse>> {
    let bot = state.registry.mount(request.into_config(bot_id)).await?;
    save_state(&state);

    Ok(Json(BotResponse {
        success: true,
        bot: bot.info().await,
    }))
}

/// GET /bots/{bot_id} - Bot details
pub async fn get_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> NluResult<Json<BotResponse>> {
    let bot = state.registry.get(&bot_id).await?;

    Ok(Json(BotResponse {
        success: true,
        bot: bot.info().await,
    }))
}

/// DELETE /bots/{bot_id} - Unmount a bot
pub async fn unmount_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> NluResult<StatusCode> {
    state.registry.unmount(&bot_id).await?;
    save_state(&state);

    Ok(StatusCode::NO_CONTENT)
}

/// POST /bots/{bot_id}/train/{lang} - Queue a training
pub async fn queue_bot_training(
    State(state): State<AppState>,
    Path((bot_id, language)): Path<(String, String)>,
) -> NluResult<Json<SessionResponse>> {
    let language: LanguageCode = language.parse()?;
    let session = state.registry.queue_training(&bot_id, &language).await?;

    Ok(Json(SessionResponse {
        success: true,
        session,
    }))
}

/// GET /bots/{bot_id}/train/{lang} - Training state of a bot language
pub async fn get_bot_training(
    State(state): State<AppState>,
    Path((bot_id, language)): Path<(String, String)>,
) -> NluResult<Json<SessionResponse>> {
    let language: LanguageCode = language.parse()?;
    let session = state.registry.get_training(&bot_id, &language).await?;

    Ok(Json(SessionResponse {
        success: true,
        session,
    }))
}

/// POST /bots/{bot_id}/train/{lang}/cancel - Cancel a queued or running training
pub async fn cancel_bot_training(
    State(state): State<AppState>,
    Path((bot_id, language)): Path<(String, String)>,
) -> NluResult<Json<SuccessResponse>> {
    let language: LanguageCode = language.parse()?;
    state.registry.cancel_training(&bot_id, &language).await?;

    Ok(Json(SuccessResponse { success: true }))
}

/// POST /bots/{bot_id}/predict - Predict through the language fallback pipeline
pub async fn bot_predict(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    AppJson(request): AppJson<BotPredictRequest>,
) -> NluResult<Json<BotPredictResponse>> {
    let prediction = state
        .registry
        .predict(&bot_id, &request.text, request.language.as_ref())
        .await?;

    Ok(Json(BotPredictResponse {
        success: true,
        prediction,
    }))
}

/// Save state asynchronously
fn save_state(state: &AppState) {
    let state_manager = state.state_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = state_manager.save().await {
            tracing::error!(error = %e, "Failed to save state");
        }
    });
}
