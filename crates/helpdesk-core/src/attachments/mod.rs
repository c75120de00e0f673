//! Attachment handling
//!
//! Validates inbound attachments against the content-type allow-list and
//! size cap, deduplicates by SHA-256 checksum, writes bytes to object
//! storage and records metadata. A failing attachment never aborts its
//! siblings or the owning message.

use crate::metrics::IngestionMetrics;
use chrono::{Duration, Utc};
use helpdesk_common::config::AttachmentConfig;
use helpdesk_common::types::{AttachmentDescriptor, MessageId, TicketId};
use helpdesk_common::{Error, Result};
use helpdesk_storage::file::FileStorage;
use helpdesk_storage::models::{Attachment, CreateAttachment};
use helpdesk_storage::repository::{AttachmentRepositoryTrait, MessageRepositoryTrait};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attachment handler
pub struct AttachmentHandler {
    storage: Arc<dyn FileStorage>,
    attachments: Arc<dyn AttachmentRepositoryTrait>,
    messages: Arc<dyn MessageRepositoryTrait>,
    allowed_types: HashSet<String>,
    max_size: usize,
    metrics: Option<Arc<IngestionMetrics>>,
}

impl AttachmentHandler {
    pub fn new(
        storage: Arc<dyn FileStorage>,
        attachments: Arc<dyn AttachmentRepositoryTrait>,
        messages: Arc<dyn MessageRepositoryTrait>,
        config: &AttachmentConfig,
    ) -> Self {
        Self {
            storage,
            attachments,
            messages,
            allowed_types: config
                .allowed_types
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
            max_size: config.max_size,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<IngestionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Store every acceptable attachment of a message; returns the stored metadata
    pub async fn process_attachments(
        &self,
        attachments: &[AttachmentDescriptor],
        ticket_id: TicketId,
        message_id: MessageId,
    ) -> Vec<Attachment> {
        let mut stored = Vec::with_capacity(attachments.len());

        for descriptor in attachments {
            match self.process_one(descriptor, ticket_id, message_id).await {
                Ok(attachment) => stored.push(attachment),
                Err(e) => {
                    let reason = match &e {
                        Error::Validation(_) => "validation",
                        Error::Storage(_) => "storage",
                        _ => "other",
                    };
                    if let Some(metrics) = &self.metrics {
                        metrics.attachment_rejected(reason);
                    }
                    warn!(
                        %message_id,
                        filename = %descriptor.filename,
                        error = %e,
                        "Attachment skipped"
                    );
                }
            }
        }

        stored
    }

    async fn process_one(
        &self,
        descriptor: &AttachmentDescriptor,
        ticket_id: TicketId,
        message_id: MessageId,
    ) -> Result<Attachment> {
        let content_type = self.validate(descriptor)?;
        let data = descriptor
            .content
            .as_deref()
            .ok_or_else(|| Error::Validation("Attachment has no content".to_string()))?;

        let checksum = hex::encode(Sha256::digest(data));

        let (storage_path, url) = match self.attachments.find_by_checksum(&checksum).await? {
            Some(existing) if self.storage.exists(&existing.storage_path).await.unwrap_or(false) => {
                debug!(%checksum, path = %existing.storage_path, "Reusing stored attachment");
                (existing.storage_path, existing.url)
            }
            _ => {
                let path = storage_path(ticket_id, message_id, &descriptor.filename);
                let path = self.storage.store(&path, data).await?;
                let url = self.storage.public_url(&path);
                (path, url)
            }
        };

        self.attachments
            .create(CreateAttachment {
                message_id,
                filename: descriptor.filename.clone(),
                content_type,
                size: data.len() as i64,
                storage_path,
                url,
                checksum,
            })
            .await
    }

    /// Returns the effective content type of an acceptable attachment
    fn validate(&self, descriptor: &AttachmentDescriptor) -> Result<String> {
        let size = descriptor
            .content
            .as_ref()
            .map_or(descriptor.size, |c| c.len());
        if size > self.max_size {
            return Err(Error::Validation(format!(
                "Attachment is {} bytes, limit is {}",
                size, self.max_size
            )));
        }

        let declared = descriptor
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();

        let content_type = if declared.is_empty() || declared == "application/octet-stream" {
            mime_guess::from_path(&descriptor.filename)
                .first()
                .map(|m| m.essence_str().to_string())
                .unwrap_or(declared)
        } else {
            declared
        };

        if !self.allowed_types.contains(&content_type) {
            return Err(Error::Validation(format!(
                "Content type {} is not allowed",
                content_type
            )));
        }

        Ok(content_type)
    }

    /// Time-limited download URL for a stored object
    pub fn generate_secure_download_url(&self, path: &str, ttl: std::time::Duration) -> Result<String> {
        self.storage.signed_url(path, ttl)
    }

    /// Remove attachments of messages older than `max_age_days`.
    ///
    /// Stored bytes are deleted once no metadata row references them.
    /// Returns the number of attachment records removed.
    pub async fn cleanup_orphaned_attachments(&self, max_age_days: i64) -> Result<usize> {
        if max_age_days < 0 {
            return Err(Error::Validation(format!(
                "Retention must not be negative, got {} days",
                max_age_days
            )));
        }
        // Beyond chrono's range nothing can be old enough
        let Some(cutoff) = Duration::try_days(max_age_days).and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            debug!(max_age_days, "Retention exceeds representable time; nothing to clean");
            return Ok(0);
        };
        let messages = self.messages.list_older_than(cutoff).await?;
        let mut removed = 0;

        for message in messages {
            for attachment in self.attachments.list_by_message(message.id).await? {
                self.attachments.delete(attachment.id).await?;
                removed += 1;

                if self.attachments.count_by_path(&attachment.storage_path).await? == 0 {
                    if let Err(e) = self.storage.delete(&attachment.storage_path).await {
                        warn!(path = %attachment.storage_path, error = %e, "Failed to delete attachment bytes");
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, max_age_days, "Cleaned up aged attachments");
        }
        Ok(removed)
    }
}

/// Lower-case the name, collapse dot runs and replace anything but ASCII letters, digits and dots
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.trim().chars() {
        match c {
            '.' if sanitized.ends_with('.') => {}
            '.' => sanitized.push('.'),
            c if c.is_ascii_alphanumeric() => sanitized.push(c.to_ascii_lowercase()),
            _ => sanitized.push('_'),
        }
    }
    let sanitized = sanitized.trim_matches('.').to_string();
    if sanitized.is_empty() {
        "attachment".to_string()
    } else {
        sanitized
    }
}

fn storage_path(ticket_id: TicketId, message_id: MessageId, filename: &str) -> String {
    format!(
        "tickets/{}/{}/{}_{}",
        ticket_id,
        message_id,
        Utc::now().timestamp_millis(),
        sanitize_filename(filename)
    )
}
