//! Outbound Mailer
//!
//! Builds and delivers replies, forwards and new messages over the
//! channel's SMTP transport. Transports are cached per channel and
//! verified before reuse; sends are retried with exponential backoff.

pub mod compose;
pub mod transport;

pub use compose::{
    build_message, forward_options, forward_subject, generate_message_id, reply_options,
    reply_subject, ComposedMessage, OriginalMessage, OutboundAttachment, SendOptions,
};
pub use transport::{MailTransport, SmtpTransport, SmtpTransportFactory, TransportFactory};

use crate::metrics::IngestionMetrics;
use crate::threading::ThreadReconstructor;
use helpdesk_common::config::OutboundConfig;
use helpdesk_common::types::{
    domain_of, ChannelId, EmailAddress, Participant, SenderType, TicketId,
};
use helpdesk_common::{Error, Result};
use helpdesk_storage::models::{Channel, CreateMessage};
use helpdesk_storage::repository::Repositories;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Outcome of a delivered message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub message_id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

/// Outbound mailer
pub struct OutboundMailer {
    factory: Arc<dyn TransportFactory>,
    transports: Mutex<HashMap<ChannelId, Arc<dyn MailTransport>>>,
    max_attempts: u32,
    backoff_base: u64,
    metrics: Option<Arc<IngestionMetrics>>,
}

impl OutboundMailer {
    pub fn new(factory: Arc<dyn TransportFactory>, config: &OutboundConfig) -> Self {
        Self {
            factory,
            transports: Mutex::new(HashMap::new()),
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base_secs,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<IngestionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cached transport for the channel, verified, or a freshly built one
    async fn transport(&self, channel: &Channel) -> Result<Arc<dyn MailTransport>> {
        let cached = self.transports.lock().await.get(&channel.id).cloned();
        if let Some(transport) = cached {
            match transport.verify().await {
                Ok(true) => return Ok(transport),
                Ok(false) => {
                    debug!(channel_id = %channel.id, "Cached transport failed verification")
                }
                Err(e) => {
                    debug!(channel_id = %channel.id, error = %e, "Cached transport failed verification")
                }
            }
            self.invalidate(channel.id).await;
        }

        let transport = self.factory.build(channel).await?;
        self.transports
            .lock()
            .await
            .insert(channel.id, transport.clone());
        Ok(transport)
    }

    /// Drop the cached transport of a channel
    pub async fn invalidate(&self, channel_id: ChannelId) {
        self.transports.lock().await.remove(&channel_id);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.backoff_base.saturating_pow(attempt))
    }

    /// Send a new message from the channel
    pub async fn send_email(&self, channel: &Channel, options: SendOptions) -> Result<SendResult> {
        let from = options
            .from
            .clone()
            .unwrap_or_else(|| Participant::new(channel.email_address.clone()));
        let domain = domain_of(&from.address).unwrap_or_else(|| "localhost".to_string());
        let composed = build_message(&from, &options, &generate_message_id(&domain))?;

        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            let outcome = match self.transport(channel).await {
                Ok(transport) => transport.send(composed.message.clone()).await,
                // Credentials and configuration will not fix themselves between attempts
                Err(e @ (Error::Auth(_) | Error::Provider(_) | Error::Config(_))) => {
                    self.record("failure");
                    error!(
                        channel_id = %channel.id,
                        error = %e,
                        "Cannot build transport; channel needs attention"
                    );
                    return Err(e);
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    info!(
                        channel_id = %channel.id,
                        message_id = %composed.message_id,
                        attempt,
                        recipients = composed.recipients.len(),
                        "Email sent"
                    );
                    self.record("success");
                    return Ok(SendResult {
                        message_id: composed.message_id,
                        accepted: composed.recipients,
                        rejected: composed.rejected,
                    });
                }
                Err(e) => {
                    warn!(
                        channel_id = %channel.id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Send attempt failed"
                    );
                    if e.is_auth_class() {
                        self.invalidate(channel.id).await;
                    }
                    last_error = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        self.record("failure");
        let last = match last_error {
            Some(Error::Send(message)) => message,
            Some(e) => e.to_string(),
            None => "no attempt made".to_string(),
        };
        error!(channel_id = %channel.id, error = %last, "Giving up on outbound email");
        Err(Error::Send(last))
    }

    /// Reply to `original`, continuing its thread
    pub async fn send_reply(
        &self,
        channel: &Channel,
        original: &OriginalMessage,
        options: SendOptions,
    ) -> Result<SendResult> {
        self.send_email(channel, reply_options(original, options)).await
    }

    /// Forward `original` with a quoted header block
    pub async fn forward_email(
        &self,
        channel: &Channel,
        original: &OriginalMessage,
        options: SendOptions,
    ) -> Result<SendResult> {
        self.send_email(channel, forward_options(original, options)).await
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.outbound_sent(outcome);
        }
    }
}

/// Send request as accepted by the HTTP API
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub ticket_id: Option<TicketId>,
    /// Sending address; also used to resolve the channel
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<OutboundAttachment>,
    /// Message being answered, when replying within a ticket
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

/// Resolves the sending channel and records ticket replies
pub struct OutboundService {
    repos: Repositories,
    mailer: Arc<OutboundMailer>,
    threads: Arc<ThreadReconstructor>,
}

impl OutboundService {
    pub fn new(
        repos: Repositories,
        mailer: Arc<OutboundMailer>,
        threads: Arc<ThreadReconstructor>,
    ) -> Self {
        Self {
            repos,
            mailer,
            threads,
        }
    }

    pub fn mailer(&self) -> &Arc<OutboundMailer> {
        &self.mailer
    }

    async fn resolve_channel(&self, request: &OutboundRequest) -> Result<Channel> {
        if let Some(id) = request.channel_id {
            return self
                .repos
                .channels
                .get(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Channel {} not found", id)));
        }
        if let Some(ticket_id) = request.ticket_id {
            let ticket = self
                .repos
                .tickets
                .get(ticket_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Ticket {} not found", ticket_id)))?;
            return self
                .repos
                .channels
                .get(ticket.channel_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Channel {} not found", ticket.channel_id)));
        }
        if let Some(from) = &request.from {
            let address = EmailAddress::parse(from)
                .map(|a| a.to_string())
                .unwrap_or_else(|| from.trim().to_string());
            return self
                .repos
                .channels
                .find_by_address(&address)
                .await?
                .ok_or_else(|| Error::NotFound(format!("No channel sends as {}", address)));
        }
        Err(Error::Validation(
            "One of channelId, ticketId or from is required".to_string(),
        ))
    }

    /// Send, and record the message on the ticket when one is given
    pub async fn send(&self, request: OutboundRequest) -> Result<SendResult> {
        let channel = self.resolve_channel(&request).await?;

        let ticket = match request.ticket_id {
            Some(id) => {
                let ticket = self
                    .repos
                    .tickets
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("Ticket {} not found", id)))?;
                let conversation = self
                    .repos
                    .tickets
                    .conversation_for_ticket(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("Ticket {} has no conversation", id)))?;
                Some((ticket, conversation))
            }
            None => None,
        };

        let mut options = SendOptions {
            from: request
                .from
                .as_deref()
                .and_then(EmailAddress::parse)
                .map(|a| Participant::new(a.to_string())),
            to: request.to.clone(),
            cc: request.cc.clone(),
            bcc: request.bcc.clone(),
            reply_to: request.reply_to.clone(),
            subject: request.subject.clone().unwrap_or_default(),
            text: request.text.clone(),
            html: request.html.clone(),
            attachments: request.attachments.clone(),
            in_reply_to: request.in_reply_to.clone(),
            references: Vec::new(),
        };

        if let Some((ticket, conversation)) = &ticket {
            let chain = self.threads.build_reference_chain(conversation.id, None).await?;
            if options.in_reply_to.is_none() {
                options.in_reply_to = chain.last().cloned();
            }
            options.references = chain;
            if options.subject.trim().is_empty() {
                options.subject = reply_subject(&ticket.subject);
            }
            if options.to.is_empty() {
                options.to.push(ticket.requester_email.clone());
            }
        }

        let result = self.mailer.send_email(&channel, options.clone()).await?;

        if let Some((ticket, conversation)) = ticket {
            let (content, content_type) = match (&options.text, &options.html) {
                (Some(text), _) => (text.clone(), "text/plain"),
                (None, Some(html)) => (html.clone(), "text/html"),
                (None, None) => (String::new(), "text/plain"),
            };
            let record = CreateMessage {
                conversation_id: conversation.id,
                ticket_id: ticket.id,
                channel_id: channel.id,
                external_message_id: Some(result.message_id.clone()),
                in_reply_to: options.in_reply_to.clone(),
                reference_ids: options.references.clone(),
                subject: Some(options.subject.clone()),
                from_address: options
                    .from
                    .as_ref()
                    .map(|p| p.address.clone())
                    .unwrap_or_else(|| channel.email_address.clone()),
                sender_type: SenderType::Agent,
                content,
                content_type: content_type.to_string(),
                metadata: serde_json::json!({
                    "to": options.to,
                    "cc": options.cc,
                    "bcc": options.bcc,
                    "accepted": result.accepted,
                    "rejected": result.rejected,
                    "attachments": options.attachments.iter().map(|a| &a.filename).collect::<Vec<_>>(),
                }),
            };

            // Delivery already happened; a failed write is logged, not surfaced.
            let recorded = match self.repos.messages.create(record).await {
                Ok(_) => self
                    .repos
                    .tickets
                    .append_reference(conversation.id, &result.message_id)
                    .await,
                Err(e) => Err(e),
            };
            if let Err(e) = recorded {
                error!(
                    ticket_id = %ticket.id,
                    message_id = %result.message_id,
                    error = %e,
                    "Failed to record outbound message"
                );
            }
        }

        Ok(result)
    }
}
