use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use thiserror::Error;

use crate::models::ApiResponse;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Db(sqlx::Error),
    #[error("Not found")]
    NotFound,
    #[error("External error: {0}")]
    External(String),
    #[error("{stage} failed: {message}")]
    Stage { stage: &'static str, message: String },
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Wrap any error raised inside a pipeline stage with the stage name.
    ///
    /// The failed job's message is this error's text, so clients polling job
    /// status see `"<stage> failed: <cause>"` rather than the bare cause.
    pub fn stage(stage: &'static str, err: impl std::fmt::Display) -> Self {
        AppError::Stage {
            stage,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            AppError::External(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Db(_) | AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
            AppError::Stage { .. } => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        (status, Json(ApiResponse::<()>::error(message))).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        AppError::Db(value)
    }
}
