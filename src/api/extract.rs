//! Request extractors whose rejections use the API error body

use crate::error::NluError;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts};

/// JSON body; a malformed or incomplete one is a precondition failure
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(NluError))]
pub struct AppJson<T>(pub T);

/// Query string; a missing or malformed parameter is a precondition failure
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(NluError))]
pub struct AppQuery<T>(pub T);

impl From<JsonRejection> for NluError {
    fn from(rejection: JsonRejection) -> Self {
        NluError::Precondition(rejection.body_text())
    }
}

impl From<QueryRejection> for NluError {
    fn from(rejection: QueryRejection) -> Self {
        NluError::Precondition(rejection.body_text())
    }
}
