//! Attachment metadata repository

use crate::db::DatabasePool;
use crate::models::{Attachment, CreateAttachment};
use async_trait::async_trait;
use helpdesk_common::types::{AttachmentId, MessageId};
use helpdesk_common::{Error, Result};
use uuid::Uuid;

/// Attachment repository trait
#[async_trait]
pub trait AttachmentRepository: Send + Sync {
    async fn create(&self, input: CreateAttachment) -> Result<Attachment>;
    async fn get(&self, id: AttachmentId) -> Result<Option<Attachment>>;
    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<Attachment>>;
    async fn list_by_message(&self, message_id: MessageId) -> Result<Vec<Attachment>>;
    /// Number of metadata rows pointing at a storage path
    async fn count_by_path(&self, storage_path: &str) -> Result<i64>;
    async fn delete(&self, id: AttachmentId) -> Result<()>;
}

/// Database attachment repository
pub struct DbAttachmentRepository {
    pool: DatabasePool,
}

impl DbAttachmentRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttachmentRepository for DbAttachmentRepository {
    async fn create(&self, input: CreateAttachment) -> Result<Attachment> {
        sqlx::query_as::<_, Attachment>(
            r#"
            INSERT INTO attachments (
                id, message_id, filename, content_type, size, storage_path, url, checksum, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.message_id)
        .bind(&input.filename)
        .bind(&input.content_type)
        .bind(input.size)
        .bind(&input.storage_path)
        .bind(&input.url)
        .bind(&input.checksum)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn get(&self, id: AttachmentId) -> Result<Option<Attachment>> {
        sqlx::query_as::<_, Attachment>("SELECT * FROM attachments WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<Attachment>> {
        sqlx::query_as::<_, Attachment>(
            "SELECT * FROM attachments WHERE checksum = $1 ORDER BY created_at ASC LIMIT 1",
        )
        .bind(checksum)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn list_by_message(&self, message_id: MessageId) -> Result<Vec<Attachment>> {
        sqlx::query_as::<_, Attachment>(
            "SELECT * FROM attachments WHERE message_id = $1 ORDER BY created_at ASC",
        )
        .bind(message_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn count_by_path(&self, storage_path: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM attachments WHERE storage_path = $1")
                .bind(storage_path)
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(count)
    }

    async fn delete(&self, id: AttachmentId) -> Result<()> {
        sqlx::query("DELETE FROM attachments WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }
}
