//! Ticket repository
//!
//! A ticket, its conversation and the opening message are created in one
//! transaction; for the email channel ticket and conversation are 1:1.

use crate::db::DatabasePool;
use crate::models::{Conversation, CreateTicket, Message, OpeningMessage, Ticket};
use crate::repository::messages::insert_message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helpdesk_common::types::{ConversationId, TicketId, TicketStatus};
use helpdesk_common::{Error, Result};
use uuid::Uuid;

/// Ticket repository trait
#[async_trait]
pub trait TicketRepository: Send + Sync {
    /// Nothing is written unless all three rows are
    async fn create_with_conversation(
        &self,
        input: CreateTicket,
        opening: OpeningMessage,
    ) -> Result<(Ticket, Conversation, Message)>;
    async fn get(&self, id: TicketId) -> Result<Option<Ticket>>;
    async fn conversation_for_ticket(&self, ticket_id: TicketId) -> Result<Option<Conversation>>;
    async fn update_status(&self, id: TicketId, status: TicketStatus) -> Result<()>;
    /// Flag as spam and close
    async fn mark_spam(&self, id: TicketId) -> Result<()>;
    /// Tickets created at or after `since`, newest first
    async fn list_created_since(&self, since: DateTime<Utc>) -> Result<Vec<Ticket>>;
    /// Append a message id to the conversation's reference list
    async fn append_reference(&self, conversation_id: ConversationId, message_id: &str) -> Result<()>;
}

/// Database ticket repository
pub struct DbTicketRepository {
    pool: DatabasePool,
}

impl DbTicketRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketRepository for DbTicketRepository {
    async fn create_with_conversation(
        &self,
        input: CreateTicket,
        opening: OpeningMessage,
    ) -> Result<(Ticket, Conversation, Message)> {
        let ticket_id = Uuid::now_v7();
        let conversation_id = Uuid::now_v7();
        let now = Utc::now();
        let references = serde_json::to_value(&input.reference_ids)
            .map_err(|e| Error::Internal(e.to_string()))?;

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let ticket = sqlx::query_as::<_, Ticket>(
            r#"
            INSERT INTO tickets (
                id, channel_id, subject, status, priority, requester_email,
                is_spam, spam_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING *
            "#,
        )
        .bind(ticket_id)
        .bind(input.channel_id)
        .bind(&input.subject)
        .bind(input.status.as_str())
        .bind(&input.priority)
        .bind(&input.requester_email)
        .bind(input.is_spam)
        .bind(input.is_spam.then_some(now))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        let conversation = sqlx::query_as::<_, Conversation>(
            r#"
            INSERT INTO conversations (id, ticket_id, channel_id, external_thread_id, reference_ids, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(conversation_id)
        .bind(ticket_id)
        .bind(input.channel_id)
        .bind(&input.external_thread_id)
        .bind(references)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

        let message = insert_message(
            &mut *tx,
            &opening.into_create(ticket_id, conversation_id, input.channel_id),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;

        Ok((ticket, conversation, message))
    }

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>> {
        sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn conversation_for_ticket(&self, ticket_id: TicketId) -> Result<Option<Conversation>> {
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE ticket_id = $1")
            .bind(ticket_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn update_status(&self, id: TicketId, status: TicketStatus) -> Result<()> {
        sqlx::query("UPDATE tickets SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn mark_spam(&self, id: TicketId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tickets
            SET is_spam = true, spam_at = COALESCE(spam_at, NOW()), status = 'closed', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn list_created_since(&self, since: DateTime<Utc>) -> Result<Vec<Ticket>> {
        sqlx::query_as::<_, Ticket>(
            "SELECT * FROM tickets WHERE created_at >= $1 ORDER BY created_at DESC",
        )
        .bind(since)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
    }

    async fn append_reference(&self, conversation_id: ConversationId, message_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET reference_ids = reference_ids || to_jsonb($2::text)
            WHERE id = $1 AND NOT reference_ids ? $2
            "#,
        )
        .bind(conversation_id)
        .bind(message_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(())
    }
}
