use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::models::FieldViolation;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("request validation failed")]
    Validation(Vec<FieldViolation>),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("{0}")]
    Internal(String),
}

/// Failure taxonomy of a relay invocation. `Display` carries the detail for
/// logs; [`RelayError::user_message`] is what a client gets to see.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream rejected request with status {status}: {detail}")]
    UpstreamRejected { status: u16, detail: String },
    /// The upstream sent its own error event after streaming began.
    #[error("upstream reported an error mid-stream: {0}")]
    UpstreamReported(String),
    #[error("upstream transport interrupted: {0}")]
    TransportInterrupted(String),
    #[error("malformed upstream frame: {0}")]
    MalformedUpstreamFrame(String),
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::UpstreamUnavailable(_) => "upstream_unavailable",
            RelayError::UpstreamRejected { .. } => "upstream_rejected",
            RelayError::UpstreamReported(_) => "upstream_reported",
            RelayError::TransportInterrupted(_) => "transport_interrupted",
            RelayError::MalformedUpstreamFrame(_) => "malformed_upstream_frame",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            RelayError::UpstreamUnavailable(_) => {
                "The model service is currently unavailable. Please try again."
            }
            RelayError::UpstreamRejected { .. } => "The model service rejected the request.",
            RelayError::UpstreamReported(_) => "The model service reported an error.",
            RelayError::TransportInterrupted(_) => {
                "The connection to the model service was interrupted."
            }
            RelayError::MalformedUpstreamFrame(_) => {
                "The model service returned a response that could not be read."
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::UpstreamRejected { .. }
            | RelayError::UpstreamReported(_)
            | RelayError::TransportInterrupted(_)
            | RelayError::MalformedUpstreamFrame(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldViolation>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Validation(fields) => make_error_response(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "request validation failed".to_owned(),
                fields,
            ),
            AppError::NotFound(message) => {
                make_error_response(StatusCode::NOT_FOUND, "not_found", message, Vec::new())
            }
            AppError::Relay(error) => make_error_response(
                error.status(),
                error.kind(),
                error.user_message().to_owned(),
                Vec::new(),
            ),
            AppError::Internal(message) => make_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                message,
                Vec::new(),
            ),
        }
    }
}

fn make_error_response(
    status: StatusCode,
    error_type: &str,
    message: String,
    fields: Vec<FieldViolation>,
) -> Response {
    let payload = ErrorEnvelope {
        error: ErrorBody {
            message,
            error_type: error_type.to_owned(),
            fields,
        },
    };

    (status, Json(payload)).into_response()
}
