//! Outbound message composition

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use helpdesk_common::types::{normalize_message_id, Participant};
use helpdesk_common::{Error, Result};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An attachment to send, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

/// What to send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Sender; defaults to the channel address
    pub from: Option<Participant>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<OutboundAttachment>,
    /// Canonical id of the message being answered
    pub in_reply_to: Option<String>,
    /// Canonical ids, oldest first
    pub references: Vec<String>,
}

/// The message a reply or forward is based on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalMessage {
    pub message_id: String,
    pub subject: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub references: Vec<String>,
}

/// A built message plus what is needed to report on it
pub struct ComposedMessage {
    pub message: Message,
    /// Canonical Message-ID (no angle brackets)
    pub message_id: String,
    pub recipients: Vec<String>,
    /// Addresses dropped because they did not parse
    pub rejected: Vec<String>,
}

/// `<timestamp.random@domain>`
pub fn generate_message_id(domain: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "<{}.{}@{}>",
        Utc::now().timestamp_millis(),
        &random[..16],
        domain
    )
}

fn has_prefix(subject: &str, prefixes: &[&str]) -> bool {
    let lower = subject.trim_start().to_lowercase();
    prefixes.iter().any(|p| lower.starts_with(p))
}

pub fn reply_subject(subject: &str) -> String {
    if has_prefix(subject, &["re:"]) {
        subject.to_string()
    } else {
        format!("Re: {}", subject)
    }
}

pub fn forward_subject(subject: &str) -> String {
    if has_prefix(subject, &["fwd:", "fw:"]) {
        subject.to_string()
    } else {
        format!("Fwd: {}", subject)
    }
}

/// Threading headers for answering `original`
pub fn reply_options(original: &OriginalMessage, mut options: SendOptions) -> SendOptions {
    let parent = normalize_message_id(&original.message_id);

    let mut references: Vec<String> = original
        .references
        .iter()
        .map(|r| normalize_message_id(r))
        .collect();
    references.extend(options.references.drain(..).map(|r| normalize_message_id(&r)));
    references.push(parent.clone());
    let mut seen = std::collections::HashSet::new();
    references.retain(|r| !r.is_empty() && seen.insert(r.clone()));

    let subject = if options.subject.trim().is_empty() {
        original.subject.clone().unwrap_or_default()
    } else {
        options.subject.clone()
    };

    options.subject = reply_subject(&subject);
    options.in_reply_to = Some(parent);
    options.references = references;
    if options.to.is_empty() {
        options.to.push(original.from.clone());
    }
    options
}

/// Subject prefix and quoted header block for forwarding `original`
pub fn forward_options(original: &OriginalMessage, mut options: SendOptions) -> SendOptions {
    let subject = original.subject.clone().unwrap_or_default();
    let date = original.date.to_rfc2822();
    let to = original.to.join(", ");
    let lead_text = options.text.take().unwrap_or_default();
    let lead_html = options.html.take().unwrap_or_else(|| {
        if lead_text.is_empty() {
            String::new()
        } else {
            format!("<p>{}</p>", escape_html(&lead_text))
        }
    });

    let quoted_text = original
        .text
        .clone()
        .or_else(|| original.html.as_deref().map(crate::spam::strip_html))
        .unwrap_or_default();
    options.text = Some(format!(
        "{}\n\n---------- Forwarded message ---------\nFrom: {}\nDate: {}\nSubject: {}\nTo: {}\n\n{}",
        lead_text, original.from, date, subject, to, quoted_text
    ));

    let quoted_html = original.html.clone().unwrap_or_else(|| {
        format!(
            "<pre>{}</pre>",
            escape_html(original.text.as_deref().unwrap_or_default())
        )
    });
    options.html = Some(format!(
        "{}<br><br><div>---------- Forwarded message ---------<br>From: {}<br>Date: {}<br>Subject: {}<br>To: {}</div><br><blockquote>{}</blockquote>",
        lead_html,
        escape_html(&original.from),
        escape_html(&date),
        escape_html(&subject),
        escape_html(&to),
        quoted_html
    ));

    options.subject = forward_subject(&subject);
    options
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn bracketed(id: &str) -> String {
    format!("<{}>", normalize_message_id(id))
}

fn parse_mailboxes(addresses: &[String], rejected: &mut Vec<String>) -> Vec<Mailbox> {
    addresses
        .iter()
        .filter_map(|a| match a.trim().parse::<Mailbox>() {
            Ok(mailbox) => Some(mailbox),
            Err(_) => {
                rejected.push(a.clone());
                None
            }
        })
        .collect()
}

/// Build a MIME message with the given Message-ID
pub fn build_message(from: &Participant, options: &SendOptions, message_id: &str) -> Result<ComposedMessage> {
    let from_mailbox: Mailbox = from
        .to_string()
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid sender address: {}", e)))?;

    let mut rejected = Vec::new();
    let to = parse_mailboxes(&options.to, &mut rejected);
    let cc = parse_mailboxes(&options.cc, &mut rejected);
    let bcc = parse_mailboxes(&options.bcc, &mut rejected);
    if to.is_empty() && cc.is_empty() && bcc.is_empty() {
        return Err(Error::Validation("No valid recipients".to_string()));
    }
    let recipients = to
        .iter()
        .chain(cc.iter())
        .chain(bcc.iter())
        .map(|m| m.email.to_string())
        .collect();

    let mut builder = Message::builder()
        .from(from_mailbox)
        .subject(options.subject.clone())
        .message_id(Some(message_id.to_string()));
    for mailbox in to {
        builder = builder.to(mailbox);
    }
    for mailbox in cc {
        builder = builder.cc(mailbox);
    }
    for mailbox in bcc {
        builder = builder.bcc(mailbox);
    }
    if let Some(reply_to) = &options.reply_to {
        let mailbox: Mailbox = reply_to
            .parse()
            .map_err(|e| Error::Validation(format!("Invalid Reply-To address: {}", e)))?;
        builder = builder.reply_to(mailbox);
    }
    if let Some(parent) = &options.in_reply_to {
        builder = builder.in_reply_to(bracketed(parent));
    }
    if !options.references.is_empty() {
        let chain: Vec<String> = options.references.iter().map(|r| bracketed(r)).collect();
        builder = builder.references(chain.join(" "));
    }

    let body = match (&options.text, &options.html) {
        (Some(text), Some(html)) => Body::Multi(
            MultiPart::alternative()
                .singlepart(SinglePart::plain(text.clone()))
                .singlepart(SinglePart::html(html.clone())),
        ),
        (None, Some(html)) => Body::Single(SinglePart::html(html.clone())),
        (Some(text), None) => Body::Single(SinglePart::plain(text.clone())),
        (None, None) => Body::Single(SinglePart::plain(String::new())),
    };

    let message = if options.attachments.is_empty() {
        match body {
            Body::Multi(part) => builder.multipart(part),
            Body::Single(part) => builder.singlepart(part),
        }
    } else {
        let mut mixed = match body {
            Body::Multi(part) => MultiPart::mixed().multipart(part),
            Body::Single(part) => MultiPart::mixed().singlepart(part),
        };
        for attachment in &options.attachments {
            let content = STANDARD.decode(attachment.content.trim()).map_err(|e| {
                Error::Validation(format!("Attachment {} is not base64: {}", attachment.filename, e))
            })?;
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                Error::Validation(format!(
                    "Attachment {} has an invalid content type: {}",
                    attachment.filename, e
                ))
            })?;
            mixed = mixed.singlepart(Attachment::new(attachment.filename.clone()).body(content, content_type));
        }
        builder.multipart(mixed)
    }
    .map_err(|e| Error::Validation(format!("Failed to build email: {}", e)))?;

    Ok(ComposedMessage {
        message,
        message_id: normalize_message_id(message_id),
        recipients,
        rejected,
    })
}

enum Body {
    Single(SinglePart),
    Multi(MultiPart),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn original() -> OriginalMessage {
        OriginalMessage {
            message_id: "<m2@example.com>".to_string(),
            subject: Some("Invoice question".to_string()),
            from: "ada@example.com".to_string(),
            to: vec!["support@acme.test".to_string()],
            date: Utc.with_ymd_and_hms(2024, 10, 1, 10, 0, 0).unwrap(),
            text: Some("Where is my invoice?".to_string()),
            html: None,
            references: vec!["m1@acme.test".to_string()],
        }
    }

    #[test]
    fn test_message_id_format() {
        let id = generate_message_id("acme.test");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@acme.test>"));
        let inner = &id[1..id.len() - 1];
        let (local, _) = inner.split_once('@').unwrap();
        let (timestamp, random) = local.split_once('.').unwrap();
        assert!(timestamp.parse::<i64>().is_ok());
        assert_eq!(random.len(), 16);
        assert_ne!(id, generate_message_id("acme.test"));
    }

    #[test]
    fn test_subject_prefixes_are_not_doubled() {
        assert_eq!(reply_subject("Help"), "Re: Help");
        assert_eq!(reply_subject("RE: Help"), "RE: Help");
        assert_eq!(reply_subject("re:Help"), "re:Help");
        assert_eq!(forward_subject("Help"), "Fwd: Help");
        assert_eq!(forward_subject("FW: Help"), "FW: Help");
    }

    #[test]
    fn test_reply_appends_original_to_chain() {
        let options = reply_options(&original(), SendOptions::default());
        assert_eq!(options.subject, "Re: Invoice question");
        assert_eq!(options.in_reply_to.as_deref(), Some("m2@example.com"));
        assert_eq!(options.references, vec!["m1@acme.test", "m2@example.com"]);
        assert_eq!(options.to, vec!["ada@example.com"]);
    }

    #[test]
    fn test_forward_quotes_original() {
        let options = forward_options(
            &original(),
            SendOptions {
                to: vec!["billing@acme.test".to_string()],
                text: Some("FYI".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(options.subject, "Fwd: Invoice question");
        let text = options.text.unwrap();
        assert!(text.starts_with("FYI"));
        assert!(text.contains("---------- Forwarded message ---------\nFrom: ada@example.com"));
        assert!(text.ends_with("Where is my invoice?"));
        let html = options.html.unwrap();
        assert!(html.contains("Forwarded message"));
        assert!(html.contains("<pre>Where is my invoice?</pre>"));
    }

    #[test]
    fn test_build_message_headers() {
        let options = reply_options(
            &original(),
            SendOptions {
                to: vec!["ada@example.com".to_string(), "not an address".to_string()],
                text: Some("Here it is".to_string()),
                html: Some("<p>Here it is</p>".to_string()),
                attachments: vec![OutboundAttachment {
                    filename: "invoice.pdf".to_string(),
                    content_type: "application/pdf".to_string(),
                    content: STANDARD.encode(b"%PDF-1.4"),
                }],
                ..Default::default()
            },
        );
        let from = Participant::new("support@acme.test").with_name("Acme Support");
        let composed = build_message(&from, &options, "<1.abc@acme.test>").unwrap();

        assert_eq!(composed.message_id, "1.abc@acme.test");
        assert_eq!(composed.recipients, vec!["ada@example.com"]);
        assert_eq!(composed.rejected, vec!["not an address"]);

        let formatted = String::from_utf8(composed.message.formatted()).unwrap();
        assert!(formatted.contains("Message-ID: <1.abc@acme.test>"));
        assert!(formatted.contains("In-Reply-To: <m2@example.com>"));
        assert!(formatted.contains("References: <m1@acme.test> <m2@example.com>"));
        assert!(formatted.contains("Subject: Re: Invoice question"));
        assert!(formatted.contains("multipart/mixed"));
        assert!(formatted.contains("multipart/alternative"));
        assert!(formatted.contains("invoice.pdf"));
    }

    #[test]
    fn test_build_requires_a_recipient() {
        let options = SendOptions {
            to: vec!["nope".to_string()],
            subject: "Hi".to_string(),
            ..Default::default()
        };
        let from = Participant::new("support@acme.test");
        assert!(matches!(
            build_message(&from, &options, "<1@acme.test>"),
            Err(Error::Validation(_))
        ));
    }
}
