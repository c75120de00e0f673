//! Inbound email webhook handler

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use helpdesk_common::types::ChannelId;
use helpdesk_common::Error;
use helpdesk_core::ingestion::SIGNATURE_HEADER;
use helpdesk_core::IngestOutcome;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::AppState;

/// Webhook intake result
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<IngestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookResponse {
    fn failed(e: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(e.to_string()),
        }
    }
}

/// Receive a pushed email
///
/// POST /api/v1/webhooks/email/:channel_id
///
/// Answers 200 with `success: false` for rejected payloads so providers do
/// not retry them; only signature failures get 401.
pub async fn receive_email(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<ChannelId>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    let channel = match state.orchestrator.webhook_channel(channel_id).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(%channel_id, "Webhook for unknown channel: {}", e);
            return (StatusCode::OK, Json(WebhookResponse::failed(&e)));
        }
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.orchestrator.authorize_webhook(&channel, &body, signature) {
        return (StatusCode::UNAUTHORIZED, Json(WebhookResponse::failed(&e)));
    }

    match state.orchestrator.process_webhook(&channel, &body).await {
        Ok(outcome) => {
            info!(%channel_id, "Webhook message accepted");
            (
                StatusCode::OK,
                Json(WebhookResponse {
                    success: true,
                    data: Some(outcome),
                    error: None,
                }),
            )
        }
        Err(e) => {
            warn!(%channel_id, "Webhook message rejected: {}", e);
            (StatusCode::OK, Json(WebhookResponse::failed(&e)))
        }
    }
}
