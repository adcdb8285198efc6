use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Core error taxonomy shared by every module. Collaborator-specific errors
/// (`node::NodeError`, `campaign_manager::CmError`) convert into this via
/// `From` impls at the point they cross into a component boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid state transition: {0}")]
    InvalidState(String),
    #[error("collaborator unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("integrity failure after partial success: {0}")]
    IntegrityFailure(String),
    #[error("permission denied")]
    Permission,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Error::Conflict(db_err.message().to_string());
            }
            if db_err.is_foreign_key_violation() {
                return Error::Conflict(db_err.message().to_string());
            }
        }
        if matches!(err, sqlx::Error::RowNotFound) {
            return Error::NotFound("row");
        }
        Error::Database(err)
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// HTTP-boundary wrapper. Nothing outside `api/` ever constructs a
/// `StatusCode` directly; every handler returns `Result<_, ApiError>` and
/// this is the single place core errors become HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response<axum::body::Body> {
        error!("api error: {self}");

        let core = match self {
            ApiError::Core(e) => e,
            ApiError::Database(e) => Error::from(e),
        };

        let (status, message) = match &core {
            Error::NotFound(what) => (StatusCode::NOT_FOUND, what.to_string()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Error::InvalidState(msg) => (StatusCode::CONFLICT, msg.clone()),
            Error::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            Error::IntegrityFailure(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            Error::Permission => (StatusCode::FORBIDDEN, "permission denied".to_string()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "database error".to_string(),
            ),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
