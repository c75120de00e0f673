//! Message repository

use crate::db::DatabasePool;
use crate::models::{CreateMessage, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helpdesk_common::types::{ChannelId, ConversationId, MessageId};
use helpdesk_common::{Error, Result};
use uuid::Uuid;

/// Message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, input: CreateMessage) -> Result<Message>;
    async fn get(&self, id: MessageId) -> Result<Option<Message>>;

    /// First stored message whose external id matches, in the order given
    async fn find_by_external_ids(&self, ids: &[String]) -> Result<Option<Message>>;

    /// Whether a message with this external id was already ingested on the channel
    async fn external_id_exists(&self, channel_id: ChannelId, external_id: &str) -> Result<bool>;

    /// Messages of a conversation, oldest first
    async fn list_by_conversation(&self, conversation_id: ConversationId) -> Result<Vec<Message>>;

    /// Whether `address` sent any message in the conversation (case-insensitive)
    async fn has_participant(&self, conversation_id: ConversationId, address: &str) -> Result<bool>;

    /// Customer messages without threading headers created since `since`
    async fn list_orphans_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>>;

    /// Write back inferred threading headers
    async fn update_threading(
        &self,
        id: MessageId,
        in_reply_to: Option<&str>,
        references: &[String],
    ) -> Result<()>;

    /// Merge keys into the metadata blob
    async fn merge_metadata(&self, id: MessageId, patch: serde_json::Value) -> Result<()>;

    /// Messages created before `cutoff`
    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message>>;
}

/// Database message repository
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn create(&self, input: CreateMessage) -> Result<Message> {
        insert_message(self.pool.pool(), &input).await
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn find_by_external_ids(&self, ids: &[String]) -> Result<Option<Message>> {
        if ids.is_empty() {
            return Ok(None);
        }

        let candidates = sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE external_message_id = ANY($1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(ids)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        Ok(ids.iter().find_map(|id| {
            candidates
                .iter()
                .find(|m| m.external_message_id.as_deref() == Some(id.as_str()))
                .cloned()
        }))
    }

    async fn external_id_exists(&self, channel_id: ChannelId, external_id: &str) -> Result<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM messages WHERE channel_id = $1 AND external_message_id = $2 LIMIT 1",
        )
        .bind(channel_id)
        .bind(external_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        Ok(row.is_some())
    }

    async fn list_by_conversation(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE conversation_id = $1 ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn has_participant(&self, conversation_id: ConversationId, address: &str) -> Result<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM messages
            WHERE conversation_id = $1 AND LOWER(from_address) = LOWER($2)
            LIMIT 1
            "#,
        )
        .bind(conversation_id)
        .bind(address)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        Ok(row.is_some())
    }

    async fn list_orphans_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE created_at >= $1
              AND sender_type = 'customer'
              AND in_reply_to IS NULL
              AND reference_ids = '[]'::jsonb
            ORDER BY created_at ASC
            "#,
        )
        .bind(since)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn update_threading(
        &self,
        id: MessageId,
        in_reply_to: Option<&str>,
        references: &[String],
    ) -> Result<()> {
        let references =
            serde_json::to_value(references).map_err(|e| Error::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE messages
            SET in_reply_to = $2,
                reference_ids = $3,
                metadata = metadata || '{"threading_inferred": true}'::jsonb
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(in_reply_to)
        .bind(references)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn merge_metadata(&self, id: MessageId, patch: serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE messages SET metadata = metadata || $2 WHERE id = $1")
            .bind(id)
            .bind(patch)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE created_at < $1 ORDER BY created_at ASC",
        )
        .bind(cutoff)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
    }
}

/// Insert a message on any executor, so ticket creation can include it in
/// its transaction
pub(crate) async fn insert_message<'e, E>(executor: E, input: &CreateMessage) -> Result<Message>
where
    E: sqlx::PgExecutor<'e>,
{
    let id = Uuid::now_v7();
    let references = serde_json::to_value(&input.reference_ids)
        .map_err(|e| Error::Internal(e.to_string()))?;

    sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages (
            id, conversation_id, ticket_id, channel_id, external_message_id, in_reply_to,
            reference_ids, subject, from_address, sender_type, content, content_type,
            metadata, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(input.conversation_id)
    .bind(input.ticket_id)
    .bind(input.channel_id)
    .bind(&input.external_message_id)
    .bind(&input.in_reply_to)
    .bind(references)
    .bind(&input.subject)
    .bind(&input.from_address)
    .bind(input.sender_type.as_str())
    .bind(&input.content)
    .bind(&input.content_type)
    .bind(&input.metadata)
    .fetch_one(executor)
    .await
    .map_err(|e| Error::Persistence(e.to_string()))
}
