//! API error type rendered as `{"error": ..., "details": ...}` responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::image_input::ImageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest {
        message: String,
        details: Option<String>,
    },
    #[error("Document processing timed out")]
    Timeout(String),
    #[error("Failed to process document")]
    Processing(String),
    #[error("{message}")]
    Storage {
        message: &'static str,
        details: String,
    },
    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>, details: impl Into<String>) -> Self {
        ApiError::BadRequest {
            message: message.into(),
            details: Some(details.into()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Processing(_) | ApiError::Storage { .. } | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Operator-facing detail; never shown as the user message.
    pub fn details(&self) -> Option<&str> {
        match self {
            ApiError::BadRequest { details, .. } => details.as_deref(),
            ApiError::Timeout(d) | ApiError::Processing(d) | ApiError::Internal(d) => Some(d.as_str()),
            ApiError::Storage { details, .. } => Some(details.as_str()),
        }
    }
}

impl From<ImageError> for ApiError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::Empty => ApiError::BadRequest {
                message: err.to_string(),
                details: None,
            },
            other => ApiError::bad_request("Invalid image data", other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}: {}", self, self.details().unwrap_or_default());
        } else {
            warn!("{}: {}", self, self.details().unwrap_or_default());
        }

        let body = ErrorBody {
            error: self.to_string(),
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}
