//! Error taxonomy shared by every data-plane component.
//!
//! Node-facing handlers translate these into protocol-legible answers
//! (`node_invalid`, `success=false`); admin handlers surface them as HTTP
//! status codes through `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Error, Debug)]
pub enum FleetError {
    /// Unknown node key, UUID, environment, query, carve or session.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record with the same unique key already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Undecodable or incomplete input, rejected before any state mutation.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// The record exists but is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("object store failure: {0}")]
    ObjectStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("base64 decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl FleetError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Conflict(_) | FleetError::InvalidState(_) => StatusCode::CONFLICT,
            FleetError::Malformed(_) | FleetError::Json(_) | FleetError::Decode(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound(_))
    }
}

#[derive(Debug, serde::Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self);
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
