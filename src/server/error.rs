use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::registry;

/// Errors surfaced to HTTP callers, rendered as `{ "error": message }`.
#[derive(Debug)]
pub(crate) enum AppError {
    /// The request body is well-formed JSON but violates a field rule.
    Validation(String),
    Registry(registry::Error),
}

impl From<registry::Error> for AppError {
    fn from(e: registry::Error) -> Self {
        AppError::Registry(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Registry(registry::Error::ProviderNotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Registry(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
        };

        let message = match self {
            AppError::Validation(msg) => msg,
            AppError::Registry(e) => e.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
