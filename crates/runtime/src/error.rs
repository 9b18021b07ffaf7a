//! Application error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::router::RouteError;

/// Application errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Plugin registrations that cannot be served as configured.
    #[error("plugin misconfigured: {0}")]
    Misconfigured(String),

    #[error("database error")]
    Database(#[from] sqlx::Error),
}

impl From<RouteError> for AppError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NotFound { .. } => AppError::NotFound,
            RouteError::Ambiguous { .. } => AppError::Misconfigured(err.to_string()),
            RouteError::Registry(e) => AppError::Internal(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Misconfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Details go to the log; callers only see a generic message.
        let message = match &self {
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal server error");
                "internal server error".to_string()
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                "internal server error".to_string()
            }
            AppError::Misconfigured(detail) => {
                tracing::error!(error = %detail, "plugin misconfigured");
                "plugin misconfigured".to_string()
            }
            _ => self.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn ambiguity_is_distinct_from_not_found() {
        let ambiguous = AppError::from(RouteError::Ambiguous {
            method: "GET".into(),
            path: "/emails/1".into(),
            candidates: vec!["a".into(), "b".into()],
        });
        assert!(matches!(ambiguous, AppError::Misconfigured(_)));
        assert_eq!(
            ambiguous.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let missing = AppError::from(RouteError::NotFound {
            method: "GET".into(),
            path: "/nope".into(),
        });
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }
}
