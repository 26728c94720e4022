use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Upstream error: {0}")]
    OriginError(String),

    #[error("Upstream unreachable: {0}")]
    OriginUnreachable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl CacheError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CacheError::OriginError(_) => StatusCode::BAD_GATEWAY,
            CacheError::OriginUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::ConfigError(_) | CacheError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match self {
            CacheError::OriginError(msg)
            | CacheError::OriginUnreachable(msg)
            | CacheError::InvalidRequest(msg)
            | CacheError::NotFound(msg)
            | CacheError::ConfigError(msg)
            | CacheError::Internal(msg) => msg,
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            CacheError::OriginUnreachable(err.to_string())
        } else if err.is_timeout() {
            CacheError::OriginUnreachable(format!("Upstream timeout: {}", err))
        } else {
            CacheError::OriginError(err.to_string())
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
