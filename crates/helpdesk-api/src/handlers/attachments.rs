//! Attachment download handlers

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use helpdesk_common::types::AttachmentId;
use helpdesk_common::Error;
use helpdesk_storage::FileStorage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use super::{error_response, ApiError};
use crate::auth::AppState;

const DEFAULT_URL_TTL_SECS: u64 = 3600;
const MAX_URL_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Deserialize)]
pub struct DownloadUrlQuery {
    /// Seconds until the URL expires
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadUrlResponse {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SignedFileQuery {
    pub expires: i64,
    pub signature: String,
}

/// Signed, time-limited download URL for an attachment
///
/// GET /api/v1/attachments/:id/url?ttl=
pub async fn download_url(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AttachmentId>,
    Query(query): Query<DownloadUrlQuery>,
) -> Result<Json<DownloadUrlResponse>, ApiError> {
    let ttl = query
        .ttl
        .unwrap_or(DEFAULT_URL_TTL_SECS)
        .clamp(1, MAX_URL_TTL_SECS);

    let attachment = state
        .repos
        .attachments
        .get(id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(Error::NotFound(format!("Attachment {} not found", id))))?;

    let url = state
        .attachments
        .generate_secure_download_url(&attachment.storage_path, Duration::from_secs(ttl))
        .map_err(error_response)?;

    Ok(Json(DownloadUrlResponse {
        url,
        expires_at: Utc::now() + chrono::Duration::seconds(ttl as i64),
    }))
}

/// Serve a stored object behind a signed URL
///
/// GET /files/*path?expires=&signature=
pub async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<SignedFileQuery>,
) -> Result<Response, StatusCode> {
    if !state
        .files
        .verify_signature(&path, query.expires, &query.signature, Utc::now())
    {
        warn!(%path, "Rejected download with invalid or expired signature");
        return Err(StatusCode::FORBIDDEN);
    }

    let data = state.files.read(&path).await.map_err(|e| {
        error!(%path, "Failed to read stored file: {}", e);
        StatusCode::NOT_FOUND
    })?;

    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}
