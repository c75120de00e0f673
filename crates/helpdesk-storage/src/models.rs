//! Database models

use chrono::{DateTime, Utc};
use helpdesk_common::types::{
    AttachmentId, ChannelId, ChannelSettings, ConversationId, MessageId, ProviderKind, SenderType,
    TicketId, TicketStatus,
};
use helpdesk_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Channel model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub email_address: String,
    pub provider: String,
    pub status: String,
    pub active: bool,
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// Provider kind, parsed from the stored name
    pub fn provider_kind(&self) -> Result<ProviderKind> {
        serde_json::from_value(serde_json::Value::String(self.provider.clone()))
            .map_err(|_| Error::Config(format!("Unknown provider: {}", self.provider)))
    }

    /// Decoded settings blob
    pub fn parsed_settings(&self) -> Result<ChannelSettings> {
        serde_json::from_value(self.settings.clone())
            .map_err(|e| Error::Config(format!("Invalid channel settings: {}", e)))
    }
}

/// Ticket model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub number: i64,
    pub channel_id: ChannelId,
    pub subject: String,
    pub status: String,
    pub priority: String,
    pub requester_email: String,
    pub is_spam: bool,
    pub spam_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn status(&self) -> TicketStatus {
        TicketStatus::parse(&self.status).unwrap_or(TicketStatus::Open)
    }
}

/// Create ticket input; a conversation is created alongside
#[derive(Debug, Clone)]
pub struct CreateTicket {
    pub channel_id: ChannelId,
    pub subject: String,
    pub requester_email: String,
    pub priority: String,
    pub status: TicketStatus,
    pub is_spam: bool,
    pub external_thread_id: Option<String>,
    pub reference_ids: Vec<String>,
}

/// Conversation model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub ticket_id: TicketId,
    pub channel_id: ChannelId,
    pub external_thread_id: Option<String>,
    pub reference_ids: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Message model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub ticket_id: TicketId,
    pub channel_id: ChannelId,
    pub external_message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub reference_ids: serde_json::Value,
    pub subject: Option<String>,
    pub from_address: String,
    pub sender_type: String,
    pub content: String,
    pub content_type: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Stored References chain
    pub fn references(&self) -> Vec<String> {
        serde_json::from_value(self.reference_ids.clone()).unwrap_or_default()
    }

    /// Whether the message carries no threading headers at all
    pub fn is_orphan(&self) -> bool {
        self.in_reply_to.is_none() && self.references().is_empty()
    }
}

/// Create message input
#[derive(Debug, Clone)]
pub struct CreateMessage {
    pub conversation_id: ConversationId,
    pub ticket_id: TicketId,
    pub channel_id: ChannelId,
    pub external_message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub reference_ids: Vec<String>,
    pub subject: Option<String>,
    pub from_address: String,
    pub sender_type: SenderType,
    pub content: String,
    pub content_type: String,
    pub metadata: serde_json::Value,
}

/// First message of a new ticket, inserted with the ticket and conversation
#[derive(Debug, Clone)]
pub struct OpeningMessage {
    pub external_message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub reference_ids: Vec<String>,
    pub subject: Option<String>,
    pub from_address: String,
    pub sender_type: SenderType,
    pub content: String,
    pub content_type: String,
    pub metadata: serde_json::Value,
}

impl OpeningMessage {
    /// Attach the message to an existing ticket's conversation
    pub fn into_create(
        self,
        ticket_id: TicketId,
        conversation_id: ConversationId,
        channel_id: ChannelId,
    ) -> CreateMessage {
        CreateMessage {
            conversation_id,
            ticket_id,
            channel_id,
            external_message_id: self.external_message_id,
            in_reply_to: self.in_reply_to,
            reference_ids: self.reference_ids,
            subject: self.subject,
            from_address: self.from_address,
            sender_type: self.sender_type,
            content: self.content,
            content_type: self.content_type,
            metadata: self.metadata,
        }
    }
}

/// Attachment metadata model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub message_id: MessageId,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub storage_path: String,
    pub url: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Create attachment input
#[derive(Debug, Clone)]
pub struct CreateAttachment {
    pub message_id: MessageId,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub storage_path: String,
    pub url: String,
    pub checksum: String,
}

/// Spam verdict audit entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SpamLog {
    pub id: uuid::Uuid,
    pub ticket_id: Option<TicketId>,
    pub message_id: Option<MessageId>,
    pub channel_id: ChannelId,
    pub is_spam: bool,
    pub score: f64,
    pub matched_rules: serde_json::Value,
    pub report: String,
    pub created_at: DateTime<Utc>,
}

/// Create spam log input
#[derive(Debug, Clone)]
pub struct CreateSpamLog {
    pub ticket_id: Option<TicketId>,
    pub message_id: Option<MessageId>,
    pub channel_id: ChannelId,
    pub is_spam: bool,
    pub score: f64,
    pub matched_rules: Vec<String>,
    pub report: String,
}
