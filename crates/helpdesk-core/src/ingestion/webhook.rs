//! Webhook intake payloads

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use helpdesk_common::types::{
    normalize_message_id, parse_message_id_list, AttachmentDescriptor, EmailAddress,
    InboundMessage, Participant,
};
use helpdesk_common::{Error, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the HMAC-SHA256 of the raw body
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Sender of a pushed message
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSender {
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Recipient, as a bare address or an object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WebhookRecipient {
    Address(String),
    Mailbox {
        email: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl WebhookRecipient {
    fn into_participant(self) -> Option<Participant> {
        let (address, name) = match self {
            WebhookRecipient::Address(address) => (address, None),
            WebhookRecipient::Mailbox { email, name } => (email, name),
        };
        let parsed = EmailAddress::parse(&address)?;
        let participant = Participant::new(parsed.to_string());
        Some(match name.filter(|n| !n.trim().is_empty()) {
            Some(name) => participant.with_name(name),
            None => participant,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAttachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<usize>,
    /// Base64 encoded bytes
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_id: Option<String>,
}

/// References, as an array or a single header value
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WebhookReferences {
    List(Vec<String>),
    Header(String),
}

/// JSON body pushed by an inbound email provider
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub from: Option<WebhookSender>,
    #[serde(default)]
    pub to: Vec<WebhookRecipient>,
    #[serde(default)]
    pub cc: Vec<WebhookRecipient>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<WebhookAttachment>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Option<WebhookReferences>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

impl WebhookPayload {
    /// Decode a raw request body
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("Malformed webhook payload: {}", e)))
    }

    /// Validate and convert into the channel-agnostic message
    pub fn into_inbound(self) -> Result<InboundMessage> {
        let message_id = self
            .message_id
            .as_deref()
            .map(normalize_message_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Validation("messageId is required".to_string()))?;

        let sender = self
            .from
            .ok_or_else(|| Error::Validation("from is required".to_string()))?;
        let address = sender
            .email
            .as_deref()
            .and_then(EmailAddress::parse)
            .ok_or_else(|| Error::Validation("from.email is not a valid address".to_string()))?;
        let mut from = Participant::new(address.to_string());
        if let Some(name) = sender.name.filter(|n| !n.trim().is_empty()) {
            from = from.with_name(name);
        }

        let subject = self
            .subject
            .ok_or_else(|| Error::Validation("subject is required".to_string()))?;

        let mut references = match self.references {
            Some(WebhookReferences::List(ids)) => ids
                .iter()
                .flat_map(|id| parse_message_id_list(id))
                .collect(),
            Some(WebhookReferences::Header(raw)) => parse_message_id_list(&raw),
            None => Vec::new(),
        };
        let mut seen = std::collections::HashSet::new();
        references.retain(|id| seen.insert(id.clone()));

        let attachments = self
            .attachments
            .into_iter()
            .filter_map(|a| decode_attachment(a, &message_id))
            .collect();

        Ok(InboundMessage {
            message_id,
            in_reply_to: self
                .in_reply_to
                .as_deref()
                .map(normalize_message_id)
                .filter(|id| !id.is_empty()),
            references,
            subject: Some(subject),
            from,
            to: self.to.into_iter().filter_map(WebhookRecipient::into_participant).collect(),
            cc: self.cc.into_iter().filter_map(WebhookRecipient::into_participant).collect(),
            text: self.text.filter(|t| !t.is_empty()),
            html: self.html.filter(|h| !h.is_empty()),
            headers: self.headers.into_iter().collect::<BTreeMap<_, _>>(),
            attachments,
            received_at: self.received_at.unwrap_or_else(Utc::now),
            uid: None,
        })
    }
}

/// Malformed attachments are dropped without failing the message
fn decode_attachment(attachment: WebhookAttachment, message_id: &str) -> Option<AttachmentDescriptor> {
    let content = match attachment.content.as_deref() {
        Some(encoded) => match STANDARD.decode(encoded.trim()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(%message_id, filename = %attachment.filename, error = %e, "Dropping attachment with invalid base64");
                return None;
            }
        },
        None => None,
    };
    let size = content
        .as_ref()
        .map(Vec::len)
        .or(attachment.size)
        .unwrap_or(0);

    Some(AttachmentDescriptor {
        filename: attachment.filename,
        content_type: attachment
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        size,
        content,
        content_id: attachment.content_id,
    })
}

/// Check a signature header (`sha256=<hex>` or bare hex) against the body
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let hex_part = signature.trim();
    let hex_part = hex_part.strip_prefix("sha256=").unwrap_or(hex_part);
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
