//! Common types for the helpdesk pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for channels
pub type ChannelId = Uuid;

/// Unique identifier for tickets
pub type TicketId = Uuid;

/// Unique identifier for conversations
pub type ConversationId = Uuid;

/// Unique identifier for stored messages
pub type MessageId = Uuid;

/// Unique identifier for attachments
pub type AttachmentId = Uuid;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address, accepting the `Name <addr>` form
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = match (s.rfind('<'), s.rfind('>')) {
            (Some(start), Some(end)) if start < end => &s[start + 1..end],
            _ => s,
        };
        let parts: Vec<&str> = s.splitn(2, '@').collect();
        if parts.len() == 2
            && !parts[0].is_empty()
            && !parts[1].is_empty()
            && !parts[1].contains('@')
            && !s.contains(char::is_whitespace)
        {
            Some(Self::new(parts[0], parts[1].to_lowercase()))
        } else {
            None
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Lower-cased domain part of an address, if it has one
pub fn domain_of(address: &str) -> Option<String> {
    EmailAddress::parse(address).map(|a| a.domain)
}

/// Canonical form of a Message-ID: trimmed, without angle brackets
pub fn normalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Split a References-style header into canonical ids, in order
pub fn parse_message_id_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .map(normalize_message_id)
        .filter(|id| !id.is_empty())
        .collect()
}

/// How a channel receives its mail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Google mailbox, OAuth2 authenticated
    Gmail,
    /// Microsoft 365 / Outlook mailbox, OAuth2 authenticated
    Outlook,
    /// Any IMAP/SMTP server with password login
    Imap,
    /// Provider pushes messages to the webhook intake
    Webhook,
}

impl ProviderKind {
    /// Whether the channel authenticates with OAuth2 tokens
    pub fn is_oauth(&self) -> bool {
        matches!(self, ProviderKind::Gmail | ProviderKind::Outlook)
    }

    /// Whether the channel is backed by a pollable mailbox
    pub fn has_mailbox(&self) -> bool {
        !matches!(self, ProviderKind::Webhook)
    }

    /// Resolve a provider from its OAuth route name
    pub fn from_oauth_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "google" | "gmail" => Some(ProviderKind::Gmail),
            "microsoft" | "outlook" => Some(ProviderKind::Outlook),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Gmail => write!(f, "gmail"),
            ProviderKind::Outlook => write!(f, "outlook"),
            ProviderKind::Imap => write!(f, "imap"),
            ProviderKind::Webhook => write!(f, "webhook"),
        }
    }
}

/// Channel health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Active,
    Degraded,
    Disabled,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Active => "active",
            ChannelStatus::Degraded => "degraded",
            ChannelStatus::Disabled => "disabled",
        }
    }
}

/// Ticket lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    Open,
    Pending,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::New => "new",
            TicketStatus::Open => "open",
            TicketStatus::Pending => "pending",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(TicketStatus::New),
            "open" => Some(TicketStatus::Open),
            "pending" => Some(TicketStatus::Pending),
            "resolved" => Some(TicketStatus::Resolved),
            "closed" => Some(TicketStatus::Closed),
            _ => None,
        }
    }

    /// Resolved and closed tickets are reopened by a new customer reply
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Resolved | TicketStatus::Closed)
    }
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Customer,
    Agent,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::Customer => "customer",
            SenderType::Agent => "agent",
            SenderType::System => "system",
        }
    }
}

/// A sender or recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Participant {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl std::fmt::Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) if !name.is_empty() => write!(f, "{} <{}>", name, self.address),
            _ => write!(f, "{}", self.address),
        }
    }
}

/// An attachment as received, before storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub filename: String,
    pub content_type: String,
    pub size: usize,

    /// Raw bytes; absent when the provider sent metadata only
    #[serde(default, skip_serializing)]
    pub content: Option<Vec<u8>>,

    /// Content ID (for inline attachments)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

/// Channel-agnostic inbound email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Canonical Message-ID (no angle brackets)
    pub message_id: String,
    pub in_reply_to: Option<String>,
    /// Ordered References chain
    pub references: Vec<String>,
    pub subject: Option<String>,
    pub from: Participant,
    pub to: Vec<Participant>,
    pub cc: Vec<Participant>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub attachments: Vec<AttachmentDescriptor>,
    pub received_at: DateTime<Utc>,
    /// Mailbox UID, for polled messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
}

impl InboundMessage {
    /// Thread-linkage ids: In-Reply-To first, then References
    pub fn linkage_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.references.len() + 1);
        if let Some(parent) = &self.in_reply_to {
            ids.push(parent.clone());
        }
        for id in &self.references {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Whether the message was produced by an automated sender
    pub fn is_auto_generated(&self) -> bool {
        let header = |name: &str| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim().to_lowercase())
        };
        if let Some(auto) = header("Auto-Submitted") {
            if auto != "no" {
                return true;
            }
        }
        matches!(
            header("Precedence").as_deref(),
            Some("bulk") | Some("junk") | Some("list")
        )
    }
}

/// OAuth2 access/refresh token set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuth2TokenSet {
    /// A token without a known expiry is treated as valid
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Connection and sync state stored in a channel's settings blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default)]
    pub imap_host: Option<String>,
    #[serde(default)]
    pub imap_port: Option<u16>,
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default)]
    pub smtp_port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tokens: Option<OAuth2TokenSet>,
    /// Highest processed mailbox UID
    #[serde(default)]
    pub watermark: Option<u32>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub folder: Option<String>,
    /// Per-channel webhook secret, overrides the global one
    #[serde(default)]
    pub webhook_secret: Option<String>,
}
