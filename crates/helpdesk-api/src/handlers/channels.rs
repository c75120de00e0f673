//! Channel maintenance handlers

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use helpdesk_common::types::ChannelId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{error_response, ApiError};
use crate::auth::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncResponse {
    pub processed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub channel_id: ChannelId,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Run one poll cycle now
///
/// POST /api/v1/channels/:channel_id/sync
pub async fn sync_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<ChannelId>,
) -> Result<Json<SyncResponse>, ApiError> {
    let processed = state
        .orchestrator
        .fetch_new_emails(channel_id)
        .await
        .map_err(error_response)?;

    info!(%channel_id, processed, "Manual sync finished");
    Ok(Json(SyncResponse { processed }))
}

/// Refresh the channel's access token regardless of expiry
///
/// POST /api/v1/channels/:channel_id/oauth/refresh
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<ChannelId>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let tokens = state
        .credentials
        .force_refresh(channel_id)
        .await
        .map_err(error_response)?;

    Ok(Json(RefreshResponse {
        channel_id,
        expires_at: tokens.expires_at,
    }))
}
