//! Error types for the NLU manager and their API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Domain errors shared by the queue, repository, service and API layers
#[derive(Debug, Error)]
pub enum NluError {
    /// Malformed request or semantically invalid training input
    #[error("{0}")]
    Precondition(String),

    #[error("Model {model_id} not found.")]
    ModelNotFound { model_id: String },

    #[error("Training for model {model_id} not found.")]
    TrainingNotFound { model_id: String },

    #[error("Bot {bot_id} not found.")]
    BotNotFound { bot_id: String },

    /// Raised when a cooperative cancel completes; converted into a state transition by callers
    #[error("Training was canceled")]
    TrainingCanceled,

    /// Raised when two admissions race on the same job key
    #[error("Training for {key} already started")]
    TrainingAlreadyStarted { key: String },

    #[error("No model found for the following languages: {}", languages.join(","))]
    NoModelForLanguages { languages: Vec<String> },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type NluResult<T> = Result<T, NluError>;

impl NluError {
    pub fn is_training_canceled(&self) -> bool {
        matches!(self, NluError::TrainingCanceled)
    }

    pub fn is_training_already_started(&self) -> bool {
        matches!(self, NluError::TrainingAlreadyStarted { .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            NluError::Precondition(_) => StatusCode::PRECONDITION_FAILED,
            NluError::ModelNotFound { .. }
            | NluError::TrainingNotFound { .. }
            | NluError::BotNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for NluError {
    fn from(err: std::io::Error) -> Self {
        NluError::Storage(err.to_string())
    }
}

impl IntoResponse for NluError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed with unexpected error");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        let body = Json(ErrorResponse {
            success: false,
            error: self.to_string(),
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
