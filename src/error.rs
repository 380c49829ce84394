use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Request-level failure classes. Degraded pipeline stages never show up
/// here; they are embedded as data in the response instead.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A required field is missing or malformed; rejected before any side effect.
    #[error("{0}")]
    Validation(String),
    /// Unknown project, unknown resource, or a path escaping its sandbox.
    #[error("{0}")]
    NotFound(String),
    /// A fatal upstream failure (the planning stage aborts the whole request).
    #[error("{code}: {detail}")]
    Upstream { code: &'static str, detail: String },
    /// Filesystem failure while reading or writing project state.
    #[error("storage failure: {0}")]
    Storage(anyhow::Error),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage(err.into())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Storage(err.into())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Storage(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Validation(message) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
            AppError::NotFound(code) => (StatusCode::NOT_FOUND, json!({ "error": code })),
            AppError::Upstream { code, detail } => {
                (StatusCode::BAD_GATEWAY, json!({ "error": code, "detail": detail }))
            }
            AppError::Storage(err) => {
                tracing::error!(error = %err, "storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "storage_failed", "detail": err.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
