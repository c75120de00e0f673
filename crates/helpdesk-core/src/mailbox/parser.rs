//! MIME parsing into the channel-agnostic `InboundMessage`

use chrono::{TimeZone, Utc};
use helpdesk_common::types::{
    normalize_message_id, parse_message_id_list, AttachmentDescriptor, InboundMessage,
    Participant,
};
use helpdesk_common::{Error, Result};
use mail_parser::{Address, HeaderValue, Message, MessageParser, MimeHeaders, PartType};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

/// Nested multipart levels walked before giving up on a branch
const MAX_PART_DEPTH: usize = 32;

#[derive(Default)]
struct Bodies {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<AttachmentDescriptor>,
}

/// Parse a raw RFC 5322 message
pub fn parse_message(raw: &[u8], uid: Option<u32>) -> Result<InboundMessage> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| Error::Validation("Unparseable MIME message".to_string()))?;

    let from = first_participant(message.from())
        .ok_or_else(|| Error::Validation("Message has no sender".to_string()))?;

    let message_id = message
        .message_id()
        .map(normalize_message_id)
        .filter(|id| !id.is_empty())
        // A stable synthetic id keeps re-fetches deduplicated
        .unwrap_or_else(|| format!("{}@generated.helpdesk", hex::encode(Sha256::digest(raw))));

    let in_reply_to = header_ids(message.in_reply_to()).into_iter().next();
    let references = header_ids(message.references());

    let mut bodies = Bodies::default();
    if !message.parts.is_empty() {
        walk_part(&message, 0, 0, &mut bodies);
    }

    Ok(InboundMessage {
        message_id,
        in_reply_to,
        references,
        subject: message
            .subject()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        from,
        to: participants(message.to()),
        cc: participants(message.cc()),
        text: bodies.text,
        html: bodies.html,
        headers: raw_headers(&message, raw),
        attachments: bodies.attachments,
        received_at: message
            .date()
            .and_then(|d| Utc.timestamp_opt(d.to_timestamp(), 0).single())
            .unwrap_or_else(Utc::now),
        uid,
    })
}

/// Depth-first walk; the first non-empty text and html parts win
fn walk_part(message: &Message<'_>, part_id: usize, depth: usize, bodies: &mut Bodies) {
    if depth > MAX_PART_DEPTH {
        warn!(depth, "MIME nesting too deep; remaining parts ignored");
        return;
    }
    let Some(part) = message.parts.get(part_id) else {
        return;
    };

    let is_attachment = part
        .content_disposition()
        .map_or(false, |d| d.ctype().eq_ignore_ascii_case("attachment"));

    match &part.body {
        PartType::Multipart(children) => {
            for child in children {
                walk_part(message, *child, depth + 1, bodies);
            }
        }
        PartType::Text(text) if !is_attachment => {
            if bodies.text.is_none() && !text.trim().is_empty() {
                bodies.text = Some(text.to_string());
            }
        }
        PartType::Html(html) if !is_attachment => {
            if bodies.html.is_none() && !html.trim().is_empty() {
                bodies.html = Some(html.to_string());
            }
        }
        _ => {
            let content = part.contents().to_vec();
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string())
                .to_lowercase();

            bodies.attachments.push(AttachmentDescriptor {
                filename: part
                    .attachment_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "attachment".to_string()),
                content_type,
                size: content.len(),
                content: Some(content),
                content_id: part.content_id().map(normalize_message_id),
            });
        }
    }
}

fn header_ids(value: &HeaderValue<'_>) -> Vec<String> {
    match value {
        HeaderValue::Text(text) => parse_message_id_list(text),
        HeaderValue::TextList(list) => list
            .iter()
            .flat_map(|text| parse_message_id_list(text))
            .collect(),
        _ => Vec::new(),
    }
}

fn participants(address: Option<&Address<'_>>) -> Vec<Participant> {
    let addrs: Vec<&mail_parser::Addr<'_>> = match address {
        Some(Address::List(list)) => list.iter().collect(),
        Some(Address::Group(groups)) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
        None => Vec::new(),
    };

    addrs
        .into_iter()
        .filter_map(|addr| {
            let email = addr.address()?.trim().to_string();
            if email.is_empty() {
                return None;
            }
            let participant = Participant::new(email);
            Some(match addr.name().map(str::trim).filter(|n| !n.is_empty()) {
                Some(name) => participant.with_name(name),
                None => participant,
            })
        })
        .collect()
}

fn first_participant(address: Option<&Address<'_>>) -> Option<Participant> {
    participants(address).into_iter().next()
}

/// Header name to unparsed value; the first occurrence of a name wins
fn raw_headers(message: &Message<'_>, raw: &[u8]) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    let Some(root) = message.parts.first() else {
        return headers;
    };

    for header in &root.headers {
        let (start, end) = (header.offset_start as usize, header.offset_end as usize);
        let Some(bytes) = raw.get(start..end) else {
            continue;
        };
        let value = String::from_utf8_lossy(bytes)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        headers.entry(header.name().to_string()).or_insert(value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NESTED: &str = concat!(
        "From: \"Ada Lovelace\" <Ada@Example.com>\r\n",
        "To: support@acme.test, Billing <billing@acme.test>\r\n",
        "Cc: boss@example.com\r\n",
        "Subject: Re: Invoice question\r\n",
        "Message-ID: <m2@example.com>\r\n",
        "In-Reply-To: <m1@acme.test>\r\n",
        "References: <m0@acme.test>\r\n <m1@acme.test>\r\n",
        "Auto-Submitted: no\r\n",
        "Date: Tue, 1 Oct 2024 10:00:00 +0000\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
        "\r\n",
        "--outer\r\n",
        "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
        "\r\n",
        "--inner\r\n",
        "Content-Type: text/plain; charset=utf-8\r\n",
        "\r\n",
        "Where is my invoice?\r\n",
        "--inner\r\n",
        "Content-Type: text/html; charset=utf-8\r\n",
        "\r\n",
        "<p>Where is my <b>invoice</b>?</p>\r\n",
        "--inner--\r\n",
        "--outer\r\n",
        "Content-Type: text/plain; name=\"second.txt\"\r\n",
        "Content-Disposition: attachment; filename=\"second.txt\"\r\n",
        "\r\n",
        "not the body\r\n",
        "--outer\r\n",
        "Content-Type: application/pdf; name=\"invoice.pdf\"\r\n",
        "Content-Disposition: attachment; filename=\"invoice.pdf\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "JVBERi0xLjQ=\r\n",
        "--outer--\r\n",
    );

    #[test]
    fn test_parse_nested_multipart() {
        let message = parse_message(NESTED.as_bytes(), Some(7)).unwrap();

        assert_eq!(message.message_id, "m2@example.com");
        assert_eq!(message.in_reply_to.as_deref(), Some("m1@acme.test"));
        assert_eq!(message.references, vec!["m0@acme.test", "m1@acme.test"]);
        assert_eq!(message.subject.as_deref(), Some("Re: Invoice question"));
        assert_eq!(message.from.address, "Ada@Example.com");
        assert_eq!(message.from.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(message.to.len(), 2);
        assert_eq!(message.cc[0].address, "boss@example.com");
        assert_eq!(message.text.as_deref().map(str::trim), Some("Where is my invoice?"));
        assert!(message.html.as_deref().unwrap().contains("<b>invoice</b>"));
        assert_eq!(message.uid, Some(7));
        assert_eq!(message.received_at.to_rfc3339(), "2024-10-01T10:00:00+00:00");
        assert_eq!(message.headers.get("Auto-Submitted").map(String::as_str), Some("no"));
        assert!(!message.is_auto_generated());

        let names: Vec<&str> = message.attachments.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["second.txt", "invoice.pdf"]);
        let pdf = &message.attachments[1];
        assert_eq!(pdf.content_type, "application/pdf");
        assert_eq!(pdf.content.as_deref(), Some(&b"%PDF-1.4"[..]));
    }

    #[test]
    fn test_missing_message_id_is_stable() {
        let raw = b"From: a@x.com\r\nSubject: hi\r\n\r\nhello\r\n";
        let first = parse_message(raw, None).unwrap();
        let second = parse_message(raw, None).unwrap();
        assert_eq!(first.message_id, second.message_id);
        assert!(first.message_id.ends_with("@generated.helpdesk"));
        assert_eq!(first.text.as_deref().map(str::trim), Some("hello"));
        assert!(first.html.is_none());
    }

    #[test]
    fn test_sender_required() {
        let raw = b"Subject: orphan\r\n\r\nbody\r\n";
        assert!(matches!(parse_message(raw, None), Err(Error::Validation(_))));
    }
}
