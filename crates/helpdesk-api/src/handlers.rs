//! API request handlers

pub mod attachments;
pub mod channels;
pub mod health;
pub mod oauth;
pub mod send;
pub mod webhooks;

use axum::{http::StatusCode, Json};
use helpdesk_common::Error;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a pipeline error onto its HTTP status and machine code
pub fn error_response(e: Error) -> ApiError {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(code = e.code(), "Request failed: {}", e);
    } else {
        warn!(code = e.code(), "Request rejected: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.code().to_string(),
            message: e.to_string(),
        }),
    )
}
