//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use boardcache_core::CoreError;
use serde_json::json;
use tracing::error;

/// Upper bound on tool output echoed back to clients
pub const DIAGNOSTIC_LIMIT: usize = 4000;

#[derive(Debug)]
pub enum ApiError {
    Core(CoreError),
    NotFound(String),
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Core(err) => match err {
                CoreError::InvalidTier { .. }
                | CoreError::InvalidBoard { .. }
                | CoreError::Precondition { .. } => StatusCode::BAD_REQUEST,
                CoreError::IncapableResult { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                CoreError::Acquisition { .. } => StatusCode::BAD_GATEWAY,
                CoreError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
                CoreError::StoreIo { .. } | CoreError::InvalidConfig { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Core(err) => err.kind(),
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Core(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), kind = self.kind(), error = ?self, "Request failed");
        }

        let mut body = json!({
            "error": match &self {
                ApiError::Core(err) => err.to_string(),
                ApiError::NotFound(message) => message.clone(),
                ApiError::Internal(err) => format!("{:#}", err),
            },
            "kind": self.kind(),
        });

        if let ApiError::Core(err) = &self {
            if let Some(suggestion) = err.suggestion() {
                body["suggestion"] = json!(suggestion);
            }
            if let Some(diagnostic) = err.diagnostic() {
                body["exit_code"] = json!(diagnostic.exit_code);
                body["diagnostic"] = json!(diagnostic.render_truncated(DIAGNOSTIC_LIMIT));
            }
        }

        (status, Json(body)).into_response()
    }
}
