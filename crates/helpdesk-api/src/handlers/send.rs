//! Send email handler

use axum::{extract::State, Json};
use helpdesk_core::{OutboundRequest, SendResult};
use std::sync::Arc;
use tracing::info;

use super::{error_response, ApiError};
use crate::auth::AppState;

/// Send an email through a channel
///
/// POST /api/v1/send
///
/// The channel comes from `channelId`, else the ticket's channel, else the
/// channel owning the `from` address. Replies on a ticket are threaded and
/// recorded on it.
pub async fn send_email(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OutboundRequest>,
) -> Result<Json<SendResult>, ApiError> {
    let ticket_id = request.ticket_id;
    let result = state.outbound.send(request).await.map_err(error_response)?;

    info!(
        message_id = %result.message_id,
        ticket_id = ?ticket_id,
        accepted = result.accepted.len(),
        "Email sent"
    );
    Ok(Json(result))
}
