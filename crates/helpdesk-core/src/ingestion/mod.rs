//! Ingestion Orchestrator
//!
//! Brings every active mailbox channel online, keeps one independent task
//! per channel (push when the server supports IDLE, polling otherwise) and
//! runs each new message through the spam, threading and persistence
//! pipeline. Webhook channels enter the same pipeline via
//! [`IngestionOrchestrator::process_webhook`].

pub mod forwarder;
pub mod webhook;

pub use forwarder::{ForwardPayload, TicketForwarder};
pub use webhook::{verify_signature, WebhookPayload, SIGNATURE_HEADER};

use crate::attachments::AttachmentHandler;
use crate::mailbox::{IdleOutcome, MailboxConnector, SearchCriteria};
use crate::metrics::IngestionMetrics;
use crate::spam::{SpamCheckRequest, SpamDetector, SpamVerdict};
use crate::threading::{ThreadLookup, ThreadReconstructor};
use helpdesk_common::config::{
    AttachmentConfig, IngestionConfig, SpamConfig, ThreadingConfig, WebhookConfig,
};
use helpdesk_common::types::{
    ChannelId, ChannelStatus, ConversationId, InboundMessage, MessageId, SenderType, TicketId,
    TicketStatus,
};
use helpdesk_common::{Config, Error, Result};
use helpdesk_storage::models::{Channel, CreateSpamLog, CreateTicket, OpeningMessage};
use helpdesk_storage::repository::Repositories;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration sections the pipeline reads
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub ingestion: IngestionConfig,
    pub spam: SpamConfig,
    pub threading: ThreadingConfig,
    pub attachments: AttachmentConfig,
    pub webhook: WebhookConfig,
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            ingestion: config.ingestion.clone(),
            spam: config.spam.clone(),
            threading: config.threading.clone(),
            attachments: config.attachments.clone(),
            webhook: config.webhook.clone(),
        }
    }
}

/// Result of running one message through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Already stored for this channel
    Duplicate,
    Stored(IngestedMessage),
}

/// Where a stored message ended up
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedMessage {
    pub ticket_id: TicketId,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub created_ticket: bool,
    pub reopened: bool,
    pub is_spam: bool,
    pub spam_score: f64,
    pub attachments: usize,
}

/// Ingestion orchestrator
pub struct IngestionOrchestrator {
    repos: Repositories,
    connector: Arc<MailboxConnector>,
    spam: SpamDetector,
    threads: Arc<ThreadReconstructor>,
    attachments: Arc<AttachmentHandler>,
    metrics: Arc<IngestionMetrics>,
    forwarder: Option<Arc<TicketForwarder>>,
    config: PipelineConfig,
    workers: Mutex<HashMap<ChannelId, JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    fetch_locks: Mutex<HashMap<ChannelId, Arc<tokio::sync::Mutex<()>>>>,
    failures: Mutex<HashMap<ChannelId, u32>>,
}

impl IngestionOrchestrator {
    pub fn new(
        repos: Repositories,
        connector: Arc<MailboxConnector>,
        attachments: Arc<AttachmentHandler>,
        metrics: Arc<IngestionMetrics>,
        config: PipelineConfig,
    ) -> Self {
        let threads = Arc::new(ThreadReconstructor::new(
            repos.tickets.clone(),
            repos.messages.clone(),
            &config.threading,
        ));
        Self {
            spam: SpamDetector::new(&config.spam),
            threads,
            repos,
            connector,
            attachments,
            metrics,
            forwarder: None,
            config,
            workers: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            fetch_locks: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<TicketForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn threads(&self) -> &Arc<ThreadReconstructor> {
        &self.threads
    }

    pub fn connector(&self) -> &Arc<MailboxConnector> {
        &self.connector
    }

    /// Bring channels online and start the maintenance loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.config.webhook.secret.is_none() {
            if self.config.webhook.require_signature {
                error!("webhook.require_signature is set but no webhook secret is configured; unsigned intake will be rejected");
            } else {
                warn!("No webhook secret configured; webhook signatures will not be validated");
            }
        }

        let started = self.init_channels().await?;
        info!(channels = started, "Ingestion started");

        let supervisor = {
            let this = self.clone();
            let period = Duration::from_secs(self.config.ingestion.supervisor_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match this.init_channels().await {
                        Ok(0) => {}
                        Ok(n) => info!(channels = n, "Brought new channels online"),
                        Err(e) => error!(error = %e, "Channel supervisor scan failed"),
                    }
                }
            })
        };

        let regroup = {
            let threads = self.threads.clone();
            let period = Duration::from_secs(self.config.threading.regroup_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = threads.group_orphaned_messages().await {
                        error!(error = %e, "Orphan regrouping failed");
                    }
                }
            })
        };

        let cleanup = {
            let attachments = self.attachments.clone();
            let retention_days = self.config.attachments.retention_days;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match attachments.cleanup_orphaned_attachments(retention_days).await {
                        Ok(removed) => info!(removed, "Attachment retention sweep finished"),
                        Err(e) => error!(error = %e, "Attachment retention sweep failed"),
                    }
                }
            })
        };

        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([supervisor, regroup, cleanup]);
        Ok(())
    }

    /// Start a task for every active mailbox channel that has none running.
    /// Returns the number of tasks started.
    pub async fn init_channels(self: &Arc<Self>) -> Result<usize> {
        let channels = self.repos.channels.list_active().await?;
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let mut started = 0;

        for channel in channels {
            if !channel.provider_kind().map(|k| k.has_mailbox()).unwrap_or(false) {
                continue;
            }
            if workers.get(&channel.id).is_some_and(|h| !h.is_finished()) {
                continue;
            }
            debug!(channel_id = %channel.id, "Starting channel worker");
            let handle = tokio::spawn(self.clone().run_channel(channel.id));
            workers.insert(channel.id, handle);
            started += 1;
        }

        Ok(started)
    }

    /// Channels with a live worker task
    pub fn running_channels(&self) -> Vec<ChannelId> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Stop every task and close all mailbox connections
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            workers
                .drain()
                .map(|(_, h)| h)
                .chain(background.drain(..))
                .collect()
        };
        for handle in handles {
            handle.abort();
        }
        self.connector.registry().close_all().await;
        info!("Ingestion stopped");
    }

    async fn active_channel(&self, channel_id: ChannelId) -> Result<Option<Channel>> {
        Ok(self
            .repos
            .channels
            .get(channel_id)
            .await?
            .filter(|c| c.active))
    }

    fn folder(&self, channel: &Channel) -> String {
        channel
            .parsed_settings()
            .ok()
            .and_then(|s| s.folder)
            .unwrap_or_else(|| self.config.ingestion.folder.clone())
    }

    fn poll_interval(&self, channel: &Channel) -> Duration {
        let secs = channel
            .parsed_settings()
            .ok()
            .and_then(|s| s.poll_interval_secs)
            .unwrap_or(self.config.ingestion.poll_interval_secs);
        Duration::from_secs(secs.max(1))
    }

    /// Per-channel loop: push when possible, polling otherwise
    async fn run_channel(self: Arc<Self>, channel_id: ChannelId) {
        let channel = match self.active_channel(channel_id).await {
            Ok(Some(channel)) => channel,
            Ok(None) => return,
            Err(e) => {
                error!(%channel_id, error = %e, "Failed to load channel");
                return;
            }
        };

        if let Err(e) = self.fetch_new_emails(channel_id).await {
            warn!(%channel_id, error = %e, "Initial fetch failed");
        }

        let folder = self.folder(&channel);
        let wait = Duration::from_secs(self.config.ingestion.idle_timeout_secs.max(1));
        let callback = {
            let this = self.clone();
            move || {
                let this = this.clone();
                async move {
                    if let Err(e) = this.fetch_new_emails(channel_id).await {
                        warn!(%channel_id, error = %e, "Fetch after push notification failed");
                    }
                }
            }
        };

        match self
            .connector
            .start_idle_connection(&channel, &folder, wait, callback)
            .await
        {
            Ok(IdleOutcome::Unsupported) => {
                info!(%channel_id, "Push unavailable, polling instead");
            }
            Err(e) => {
                warn!(%channel_id, error = %e, "Push connection failed, falling back to polling");
                self.record_failure(channel_id).await;
            }
        }

        let interval = self.poll_interval(&channel);
        self.start_polling(channel_id, interval).await;
    }

    /// Poll until the channel is removed or deactivated
    pub async fn start_polling(&self, channel_id: ChannelId, interval: Duration) {
        info!(%channel_id, interval_secs = interval.as_secs(), "Polling channel");
        loop {
            tokio::time::sleep(self.poll_delay(channel_id, interval)).await;

            match self.active_channel(channel_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!(%channel_id, "Channel gone or inactive, stopping poller");
                    return;
                }
                Err(e) => {
                    warn!(%channel_id, error = %e, "Failed to reload channel");
                    continue;
                }
            }

            if let Err(e) = self.fetch_new_emails(channel_id).await {
                warn!(%channel_id, error = %e, "Poll failed");
            }
        }
    }

    /// Poll interval, stretched exponentially while the channel keeps failing
    fn poll_delay(&self, channel_id: ChannelId, interval: Duration) -> Duration {
        let failures = self.failure_count(channel_id);
        if failures == 0 {
            return interval;
        }
        let ceiling = Duration::from_secs(self.config.ingestion.max_backoff_secs).max(interval);
        interval
            .saturating_mul(2u32.saturating_pow(failures.min(16)))
            .min(ceiling)
    }

    fn failure_count(&self, channel_id: ChannelId) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel_id)
            .copied()
            .unwrap_or(0)
    }

    async fn record_failure(&self, channel_id: ChannelId) {
        self.metrics.poll_failed();
        let count = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let count = failures.entry(channel_id).or_insert(0);
            *count += 1;
            *count
        };
        if count == self.config.ingestion.failure_threshold {
            warn!(%channel_id, failures = count, "Channel marked degraded");
            if let Err(e) = self
                .repos
                .channels
                .set_status(channel_id, ChannelStatus::Degraded)
                .await
            {
                error!(%channel_id, error = %e, "Failed to mark channel degraded");
            }
        }
    }

    async fn record_success(&self, channel: &Channel) {
        let previous = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&channel.id)
            .unwrap_or(0);
        if previous >= self.config.ingestion.failure_threshold
            || channel.status == ChannelStatus::Degraded.as_str()
        {
            info!(channel_id = %channel.id, "Channel recovered");
            if let Err(e) = self
                .repos
                .channels
                .set_status(channel.id, ChannelStatus::Active)
                .await
            {
                error!(channel_id = %channel.id, error = %e, "Failed to mark channel active");
            }
        }
    }

    fn fetch_lock(&self, channel_id: ChannelId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.fetch_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(channel_id).or_default().clone()
    }

    /// Fetch and ingest everything above the channel's watermark.
    ///
    /// Messages are handled in ascending UID order and the watermark only
    /// advances past UIDs whose messages were durably recorded, so a crash
    /// or datastore failure leads to re-processing, never to skipped mail.
    /// Returns the number of newly stored messages.
    pub async fn fetch_new_emails(&self, channel_id: ChannelId) -> Result<usize> {
        let lock = self.fetch_lock(channel_id);
        let _guard = lock.lock().await;

        let channel = self
            .repos
            .channels
            .get(channel_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Channel {} not found", channel_id)))?;
        if !channel.provider_kind()?.has_mailbox() {
            return Err(Error::Validation(format!(
                "Channel {} receives mail by webhook and cannot be polled",
                channel_id
            )));
        }

        let result = self.fetch_channel(&channel).await;
        match &result {
            Ok(_) => self.record_success(&channel).await,
            Err(_) => self.record_failure(channel.id).await,
        }
        result
    }

    async fn fetch_channel(&self, channel: &Channel) -> Result<usize> {
        let watermark = channel.parsed_settings()?.watermark;
        let folder = self.folder(channel);
        let criteria = match watermark {
            Some(uid) => SearchCriteria::UidsAbove(uid),
            None => SearchCriteria::Unseen,
        };

        let batch = self
            .connector
            .fetch_messages(channel, &folder, criteria, self.config.ingestion.fetch_limit)
            .await?;

        let mut items: Vec<(u32, Option<InboundMessage>)> = batch
            .messages
            .into_iter()
            .filter_map(|m| m.uid.map(|uid| (uid, Some(m))))
            .chain(batch.unparseable.into_iter().map(|uid| (uid, None)))
            .collect();
        items.sort_by_key(|(uid, _)| *uid);

        let mut handled = None;
        let mut processed = 0;
        let mut failure = None;

        for (uid, message) in items {
            if watermark.is_some_and(|w| uid <= w) {
                continue;
            }
            if let Some(message) = message {
                match self.process_inbound(channel, message, "imap").await {
                    Ok(IngestOutcome::Stored(_)) => processed += 1,
                    Ok(IngestOutcome::Duplicate) => {}
                    Err(e) => {
                        error!(channel_id = %channel.id, uid, error = %e, "Failed to ingest message");
                        failure = Some(e);
                        break;
                    }
                }
                if let Err(e) = self.connector.mark_as_seen(channel, &folder, uid).await {
                    warn!(channel_id = %channel.id, uid, error = %e, "Failed to mark message as seen");
                }
            }
            handled = Some(uid);
        }

        if let Some(uid) = handled {
            self.repos.channels.update_watermark(channel.id, uid).await?;
            debug!(channel_id = %channel.id, watermark = uid, "Watermark advanced");
        }

        match failure {
            Some(e) => Err(e),
            None => {
                if processed > 0 {
                    info!(channel_id = %channel.id, processed, "Ingested new messages");
                }
                Ok(processed)
            }
        }
    }

    fn check_spam(&self, message: &InboundMessage) -> SpamVerdict {
        self.spam.check_spam(&SpamCheckRequest {
            content: message.text.as_deref().unwrap_or_default(),
            subject: message.subject.as_deref(),
            from: &message.from.address,
            html: message.html.as_deref(),
        })
    }

    /// Run one normalized message through spam, threading and persistence
    pub async fn process_inbound(
        &self,
        channel: &Channel,
        message: InboundMessage,
        source: &str,
    ) -> Result<IngestOutcome> {
        if self
            .repos
            .messages
            .external_id_exists(channel.id, &message.message_id)
            .await?
        {
            debug!(channel_id = %channel.id, message_id = %message.message_id, "Skipping duplicate message");
            return Ok(IngestOutcome::Duplicate);
        }

        let verdict = self.check_spam(&message);
        let auto_generated = message.is_auto_generated();

        let lookup = ThreadLookup {
            message_id: Some(&message.message_id),
            in_reply_to: message.in_reply_to.as_deref(),
            references: &message.references,
            subject: message.subject.as_deref(),
            from_address: Some(&message.from.address),
        };
        let existing = match self.threads.find_existing_thread(&lookup).await {
            Ok(found) => found,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Thread lookup failed, opening a new ticket");
                None
            }
        };

        let (content, content_type) = match (&message.text, &message.html) {
            (Some(text), _) => (text.clone(), "text/plain"),
            (None, Some(html)) => (html.clone(), "text/html"),
            (None, None) => (String::new(), "text/plain"),
        };
        let metadata = serde_json::json!({
            "source": source,
            "uid": message.uid,
            "from_name": message.from.name,
            "to": message.to,
            "cc": message.cc,
            "headers": message.headers,
            "html": message.text.as_ref().and(message.html.as_ref()),
            "received_at": message.received_at,
            "auto_generated": auto_generated,
            "spam": {
                "is_spam": verdict.is_spam,
                "score": verdict.score,
                "rules": verdict.matched_rules,
            },
        });
        let opening = OpeningMessage {
            external_message_id: Some(message.message_id.clone()),
            in_reply_to: message.in_reply_to.clone(),
            reference_ids: message.references.clone(),
            subject: message.subject.clone(),
            from_address: message.from.address.clone(),
            sender_type: SenderType::Customer,
            content,
            content_type: content_type.to_string(),
            metadata,
        };

        let mut reopened = false;
        let (ticket_id, conversation_id, created_ticket, stored) = match existing {
            Some(found) => {
                if let Some(ticket) = self.repos.tickets.get(found.ticket_id).await? {
                    if ticket.status().is_terminal()
                        && !ticket.is_spam
                        && !verdict.is_spam
                        && !auto_generated
                    {
                        self.repos
                            .tickets
                            .update_status(ticket.id, TicketStatus::Open)
                            .await?;
                        reopened = true;
                        info!(ticket_id = %ticket.id, "Reopened ticket on customer reply");
                    }
                }
                let stored = self
                    .repos
                    .messages
                    .create(opening.into_create(found.ticket_id, found.conversation_id, channel.id))
                    .await?;
                self.repos
                    .tickets
                    .append_reference(found.conversation_id, &message.message_id)
                    .await?;
                (found.ticket_id, found.conversation_id, false, stored)
            }
            None => {
                let mut references = message.references.clone();
                if let Some(parent) = &message.in_reply_to {
                    if !references.contains(parent) {
                        references.push(parent.clone());
                    }
                }
                let external_thread_id = references
                    .first()
                    .cloned()
                    .unwrap_or_else(|| message.message_id.clone());
                if !references.contains(&message.message_id) {
                    references.push(message.message_id.clone());
                }
                let (ticket, conversation, stored) = self
                    .repos
                    .tickets
                    .create_with_conversation(
                        CreateTicket {
                            channel_id: channel.id,
                            subject: message
                                .subject
                                .clone()
                                .filter(|s| !s.trim().is_empty())
                                .unwrap_or_else(|| "(no subject)".to_string()),
                            requester_email: message.from.address.clone(),
                            priority: "normal".to_string(),
                            status: if verdict.is_spam {
                                TicketStatus::Closed
                            } else {
                                TicketStatus::New
                            },
                            is_spam: verdict.is_spam,
                            external_thread_id: Some(external_thread_id),
                            reference_ids: references,
                        },
                        opening,
                    )
                    .await?;
                (ticket.id, conversation.id, true, stored)
            }
        };

        let attachments = self
            .attachments
            .process_attachments(&message.attachments, ticket_id, stored.id)
            .await;
        if !attachments.is_empty() {
            let summary: Vec<_> = attachments
                .iter()
                .map(|a| serde_json::json!({ "id": a.id, "filename": a.filename, "url": a.url }))
                .collect();
            if let Err(e) = self
                .repos
                .messages
                .merge_metadata(stored.id, serde_json::json!({ "attachments": summary }))
                .await
            {
                warn!(message_id = %stored.id, error = %e, "Failed to record attachment metadata");
            }
        }

        if verdict.is_spam {
            self.metrics.spam_detected();
            info!(
                %ticket_id,
                score = verdict.score,
                rules = ?verdict.matched_rules,
                "Message classified as spam"
            );
        } else if !verdict.matched_rules.is_empty() {
            debug!(%ticket_id, score = verdict.score, rules = ?verdict.matched_rules, "Spam rules matched below threshold");
        }
        if let Err(e) = self
            .repos
            .spam_logs
            .record(CreateSpamLog {
                ticket_id: Some(ticket_id),
                message_id: Some(stored.id),
                channel_id: channel.id,
                is_spam: verdict.is_spam,
                score: verdict.score,
                matched_rules: verdict.matched_rules.clone(),
                report: verdict.report.clone(),
            })
            .await
        {
            warn!(message_id = %stored.id, error = %e, "Failed to write spam audit log");
        }

        self.metrics
            .message_ingested(&channel.id.to_string(), source);

        let ingested = IngestedMessage {
            ticket_id,
            conversation_id,
            message_id: stored.id,
            created_ticket,
            reopened,
            is_spam: verdict.is_spam,
            spam_score: verdict.score,
            attachments: attachments.len(),
        };

        info!(
            channel_id = %channel.id,
            %ticket_id,
            message_id = %message.message_id,
            created_ticket,
            reopened,
            "Message ingested"
        );

        if let Some(forwarder) = &self.forwarder {
            let payload = ForwardPayload {
                event: "message.ingested",
                channel_id: channel.id,
                ticket_id,
                conversation_id,
                message_id: stored.id,
                created_ticket,
                reopened,
                is_spam: verdict.is_spam,
                spam_score: verdict.score,
                message: &message,
            };
            if let Err(e) = forwarder.forward(&payload).await {
                warn!(%ticket_id, error = %e, "Failed to forward ingested message");
            }
        }

        Ok(IngestOutcome::Stored(ingested))
    }

    /// Active channel addressed by a webhook
    pub async fn webhook_channel(&self, channel_id: ChannelId) -> Result<Channel> {
        self.active_channel(channel_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Channel {} not found", channel_id)))
    }

    /// Check the request signature against the channel's or the global secret.
    ///
    /// Without any secret the request is accepted with a warning, unless
    /// `webhook.require_signature` is set.
    pub fn authorize_webhook(
        &self,
        channel: &Channel,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<()> {
        let secret = channel
            .parsed_settings()
            .ok()
            .and_then(|s| s.webhook_secret)
            .or_else(|| self.config.webhook.secret.clone())
            .filter(|s| !s.is_empty());

        match secret {
            Some(secret) => {
                if verify_signature(&secret, body, signature) {
                    Ok(())
                } else {
                    warn!(channel_id = %channel.id, "Rejected webhook with invalid signature");
                    Err(Error::Auth("Invalid webhook signature".to_string()))
                }
            }
            None if self.config.webhook.require_signature => {
                error!(channel_id = %channel.id, "Webhook signature required but no secret is configured");
                Err(Error::Auth("Webhook signature required".to_string()))
            }
            None => {
                warn!(channel_id = %channel.id, "Accepting unsigned webhook; no secret configured");
                Ok(())
            }
        }
    }

    /// Decode a webhook body and ingest it
    pub async fn process_webhook(&self, channel: &Channel, body: &[u8]) -> Result<IngestOutcome> {
        let message = WebhookPayload::from_slice(body)?.into_inbound()?;
        self.process_inbound(channel, message, "webhook").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialManager, ProviderRegistry};
    use crate::mailbox::{ConnectionRegistry, IdleEvent, RawMessage};
    use crate::testing::{FakeMailbox, FakeOpener, MemoryStore};
    use chrono::Utc;
    use helpdesk_common::config::StorageConfig;
    use helpdesk_common::types::{ChannelSettings, ProviderKind};
    use helpdesk_storage::file::LocalStorage;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        store: MemoryStore,
        mailbox: Arc<FakeMailbox>,
        metrics: Arc<IngestionMetrics>,
        orchestrator: Arc<IngestionOrchestrator>,
        _dir: TempDir,
    }

    fn fixture_with(config: PipelineConfig) -> Fixture {
        let store = MemoryStore::new();
        let repos = store.repositories();
        let mailbox = Arc::new(FakeMailbox::new());
        let opener = Arc::new(FakeOpener::new(mailbox.clone()));
        let providers = ProviderRegistry::from_config(&Default::default()).unwrap();
        let credentials = Arc::new(CredentialManager::new(repos.channels.clone(), providers));
        let connector = Arc::new(MailboxConnector::new(
            credentials,
            opener,
            Arc::new(ConnectionRegistry::new()),
        ));

        let dir = TempDir::new().unwrap();
        let storage = Arc::new(
            LocalStorage::new(&StorageConfig {
                backend: "fs".to_string(),
                path: dir.path().to_path_buf(),
                public_base_url: "https://files.test".to_string(),
                signing_secret: "k".to_string(),
            })
            .unwrap(),
        );
        let metrics = Arc::new(IngestionMetrics::new().unwrap());
        let attachments = Arc::new(
            AttachmentHandler::new(
                storage,
                repos.attachments.clone(),
                repos.messages.clone(),
                &config.attachments,
            )
            .with_metrics(metrics.clone()),
        );

        let orchestrator = Arc::new(IngestionOrchestrator::new(
            repos,
            connector,
            attachments,
            metrics.clone(),
            config,
        ));
        Fixture {
            store,
            mailbox,
            metrics,
            orchestrator,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(PipelineConfig::default())
    }

    fn imap_channel(store: &MemoryStore) -> Channel {
        store.add_channel(
            "support@acme.test",
            ProviderKind::Imap,
            ChannelSettings {
                imap_host: Some("mail.acme.test".to_string()),
                password: Some("secret".to_string()),
                ..Default::default()
            },
        )
    }

    fn raw(uid: u32, from: &str, subject: &str, extra_headers: &str) -> RawMessage {
        RawMessage {
            uid,
            data: format!(
                "From: {}\r\nTo: support@acme.test\r\nMessage-ID: <m{}@example.com>\r\nSubject: {}\r\n{}\r\nThanks for looking into order {}.\r\n",
                from, uid, subject, extra_headers, uid
            )
            .into_bytes(),
        }
    }

    fn inbound(message_id: &str, from: &str, subject: &str) -> InboundMessage {
        InboundMessage {
            message_id: message_id.to_string(),
            in_reply_to: None,
            references: vec![],
            subject: Some(subject.to_string()),
            from: helpdesk_common::types::Participant::new(from),
            to: vec![],
            cc: vec![],
            text: Some("Could you please check my account settings?".to_string()),
            html: None,
            headers: Default::default(),
            attachments: vec![],
            received_at: Utc::now(),
            uid: None,
        }
    }

    fn watermark(store: &MemoryStore, channel: &Channel) -> Option<u64> {
        store.channel(channel.id).settings["watermark"].as_u64()
    }

    #[tokio::test]
    async fn test_fetch_advances_watermark_and_skips_processed() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        f.mailbox.push(raw(3, "ada@example.com", "Printer jam", ""));
        f.mailbox.push(raw(5, "bob@example.com", "Login trouble", ""));

        let processed = f.orchestrator.fetch_new_emails(channel.id).await.unwrap();
        assert_eq!(processed, 2);
        assert_eq!(watermark(&f.store, &channel), Some(5));
        assert_eq!(f.store.tickets().len(), 2);
        assert!(f.mailbox.is_seen(3));
        assert!(f.mailbox.is_seen(5));

        f.mailbox.push(raw(7, "cy@example.com", "Invoice copy", ""));
        let processed = f.orchestrator.fetch_new_emails(channel.id).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(watermark(&f.store, &channel), Some(7));
        assert_eq!(f.store.messages().len(), 3);

        assert_eq!(f.orchestrator.fetch_new_emails(channel.id).await.unwrap(), 0);
        assert!(f
            .metrics
            .render()
            .unwrap()
            .contains("helpdesk_messages_ingested_total"));
    }

    #[tokio::test]
    async fn test_unparseable_message_still_advances_watermark() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        f.mailbox.push(RawMessage {
            uid: 9,
            data: b"garbage without headers".to_vec(),
        });

        assert_eq!(f.orchestrator.fetch_new_emails(channel.id).await.unwrap(), 0);
        assert_eq!(watermark(&f.store, &channel), Some(9));
    }

    #[tokio::test]
    async fn test_failed_retrieval_holds_watermark() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        f.mailbox.push(raw(4, "ada@example.com", "Printer jam", ""));
        f.mailbox.push(raw(5, "bob@example.com", "Login trouble", ""));
        f.mailbox.push(raw(6, "cy@example.com", "Invoice copy", ""));
        f.mailbox.fail_fetch_once(5);

        assert_eq!(f.orchestrator.fetch_new_emails(channel.id).await.unwrap(), 1);
        assert_eq!(watermark(&f.store, &channel), Some(4));
        assert!(!f.mailbox.is_seen(6));

        assert_eq!(f.orchestrator.fetch_new_emails(channel.id).await.unwrap(), 2);
        assert_eq!(watermark(&f.store, &channel), Some(6));
        assert_eq!(f.store.tickets().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_message_write_leaves_no_ticket() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        let mut message = inbound("<nosubj@example.com>", "ada@example.com", "");
        message.subject = None;

        f.store.reject_message_writes(true);
        let err = f
            .orchestrator
            .process_inbound(&channel, message.clone(), "imap")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(f.store.tickets().is_empty());
        assert!(f.store.messages().is_empty());

        f.store.reject_message_writes(false);
        let outcome = f
            .orchestrator
            .process_inbound(&channel, message, "imap")
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored(ref m) if m.created_ticket));
        assert_eq!(f.store.tickets().len(), 1);
        assert_eq!(f.store.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_reply_reopens_closed_ticket() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        let (ticket, conversation) = f.store.insert_ticket(
            channel.id,
            "Broken widget",
            "ada@example.com",
            TicketStatus::Closed,
            Utc::now() - chrono::Duration::days(30),
        );
        f.store.insert_message(
            &conversation,
            Some("abc@x"),
            "ada@example.com",
            Some("Broken widget"),
            Utc::now() - chrono::Duration::days(30),
        );

        let mut reply = inbound("reply1@example.com", "ada@example.com", "Something else entirely");
        reply.in_reply_to = Some("abc@x".to_string());

        let outcome = f
            .orchestrator
            .process_inbound(&channel, reply, "imap")
            .await
            .unwrap();
        let IngestOutcome::Stored(stored) = outcome else {
            panic!("expected a stored message");
        };
        assert_eq!(stored.ticket_id, ticket.id);
        assert!(!stored.created_ticket);
        assert!(stored.reopened);
        assert_eq!(f.store.ticket(ticket.id).status, "open");
    }

    #[tokio::test]
    async fn test_auto_reply_does_not_reopen() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        let (ticket, conversation) = f.store.insert_ticket(
            channel.id,
            "Broken widget",
            "ada@example.com",
            TicketStatus::Resolved,
            Utc::now(),
        );
        f.store
            .insert_message(&conversation, Some("abc@x"), "ada@example.com", None, Utc::now());

        let mut reply = inbound("ooo@example.com", "ada@example.com", "Out of office");
        reply.in_reply_to = Some("abc@x".to_string());
        reply
            .headers
            .insert("Auto-Submitted".to_string(), "auto-replied".to_string());

        f.orchestrator
            .process_inbound(&channel, reply, "imap")
            .await
            .unwrap();
        assert_eq!(f.store.ticket(ticket.id).status, "resolved");
    }

    #[tokio::test]
    async fn test_duplicate_message_is_skipped() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        let message = inbound("same@example.com", "ada@example.com", "Hello");

        let first = f
            .orchestrator
            .process_inbound(&channel, message.clone(), "imap")
            .await
            .unwrap();
        assert!(matches!(first, IngestOutcome::Stored(_)));
        let second = f
            .orchestrator
            .process_inbound(&channel, message, "imap")
            .await
            .unwrap();
        assert_eq!(second, IngestOutcome::Duplicate);
        assert_eq!(f.store.tickets().len(), 1);
    }

    #[tokio::test]
    async fn test_blacklisted_sender_opens_spam_ticket() {
        let f = fixture_with(PipelineConfig {
            spam: SpamConfig {
                blacklist: vec!["spam.example".to_string()],
                ..SpamConfig::default()
            },
            ..PipelineConfig::default()
        });
        let channel = imap_channel(&f.store);

        let outcome = f
            .orchestrator
            .process_inbound(&channel, inbound("s1@spam.example", "deals@spam.example", "Hi"), "imap")
            .await
            .unwrap();
        let IngestOutcome::Stored(stored) = outcome else {
            panic!("expected a stored message");
        };
        assert!(stored.is_spam);
        let ticket = f.store.ticket(stored.ticket_id);
        assert!(ticket.is_spam);
        assert_eq!(ticket.status, "closed");

        let logs = f.store.spam_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].is_spam);
        assert_eq!(logs[0].score, 10.0);
        assert!(f
            .metrics
            .render()
            .unwrap()
            .contains("helpdesk_spam_detected_total 1"));
    }

    #[tokio::test]
    async fn test_attachments_are_stored_with_message() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        let mut message = inbound("att@example.com", "ada@example.com", "Receipt");
        message.attachments.push(helpdesk_common::types::AttachmentDescriptor {
            filename: "Receipt.PDF".to_string(),
            content_type: "application/pdf".to_string(),
            size: 8,
            content: Some(b"%PDF-1.4".to_vec()),
            content_id: None,
        });
        message.attachments.push(helpdesk_common::types::AttachmentDescriptor {
            filename: "virus.exe".to_string(),
            content_type: "application/x-msdownload".to_string(),
            size: 2,
            content: Some(b"MZ".to_vec()),
            content_id: None,
        });

        let IngestOutcome::Stored(stored) = f
            .orchestrator
            .process_inbound(&channel, message, "imap")
            .await
            .unwrap()
        else {
            panic!("expected a stored message");
        };
        assert_eq!(stored.attachments, 1);
        assert_eq!(f.store.attachments()[0].filename, "Receipt.PDF");
        let recorded = f
            .store
            .messages()
            .into_iter()
            .find(|m| m.id == stored.message_id)
            .unwrap();
        assert_eq!(recorded.metadata["attachments"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_degrade_channel() {
        let f = fixture_with(PipelineConfig {
            ingestion: IngestionConfig {
                failure_threshold: 2,
                ..IngestionConfig::default()
            },
            ..PipelineConfig::default()
        });
        let channel = imap_channel(&f.store);
        f.mailbox.set_broken(true);

        assert!(f.orchestrator.fetch_new_emails(channel.id).await.is_err());
        assert_eq!(f.store.channel(channel.id).status, "active");
        assert!(f.orchestrator.fetch_new_emails(channel.id).await.is_err());
        assert_eq!(f.store.channel(channel.id).status, "degraded");

        f.mailbox.set_broken(false);
        f.orchestrator.fetch_new_emails(channel.id).await.unwrap();
        assert_eq!(f.store.channel(channel.id).status, "active");
    }

    #[tokio::test]
    async fn test_webhook_channel_cannot_be_polled() {
        let f = fixture();
        let channel = f
            .store
            .add_channel("hooks@acme.test", ProviderKind::Webhook, ChannelSettings::default());
        let err = f.orchestrator.fetch_new_emails(channel.id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_webhook_authorization() {
        let f = fixture_with(PipelineConfig {
            webhook: WebhookConfig {
                secret: Some("global".to_string()),
                require_signature: false,
            },
            ..PipelineConfig::default()
        });
        let channel = f.store.add_channel(
            "hooks@acme.test",
            ProviderKind::Webhook,
            ChannelSettings {
                webhook_secret: Some("per-channel".to_string()),
                ..Default::default()
            },
        );
        let body = br#"{"messageId":"w1@x","from":{"email":"a@x.com"},"subject":"Hi"}"#;

        let good = forwarder::sign("per-channel", body).unwrap();
        assert!(f.orchestrator.authorize_webhook(&channel, body, Some(&good)).is_ok());
        let global = forwarder::sign("global", body).unwrap();
        assert!(matches!(
            f.orchestrator.authorize_webhook(&channel, body, Some(&global)),
            Err(Error::Auth(_))
        ));
        assert!(f.orchestrator.authorize_webhook(&channel, body, None).is_err());
    }

    #[tokio::test]
    async fn test_unsigned_webhook_policy() {
        let body = b"{}";
        let open = fixture();
        let channel = open
            .store
            .add_channel("hooks@acme.test", ProviderKind::Webhook, ChannelSettings::default());
        assert!(open.orchestrator.authorize_webhook(&channel, body, None).is_ok());

        let strict = fixture_with(PipelineConfig {
            webhook: WebhookConfig {
                secret: None,
                require_signature: true,
            },
            ..PipelineConfig::default()
        });
        let channel = strict
            .store
            .add_channel("hooks@acme.test", ProviderKind::Webhook, ChannelSettings::default());
        assert!(matches!(
            strict.orchestrator.authorize_webhook(&channel, body, None),
            Err(Error::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_missing_subject_creates_nothing() {
        let f = fixture();
        let channel = f
            .store
            .add_channel("hooks@acme.test", ProviderKind::Webhook, ChannelSettings::default());
        let body = br#"{"messageId":"w1@x","from":{"email":"a@x.com"},"text":"hello"}"#;

        let err = f.orchestrator.process_webhook(&channel, body).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(f.store.tickets().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_reply_joins_thread() {
        let f = fixture();
        let channel = f
            .store
            .add_channel("hooks@acme.test", ProviderKind::Webhook, ChannelSettings::default());
        let first = br#"{"messageId":"<w1@x.com>","from":{"email":"a@x.com"},"subject":"Help with billing","text":"My invoice looks wrong this month"}"#;
        let second = br#"{"messageId":"<w2@x.com>","from":{"email":"a@x.com"},"subject":"Re: Help with billing","text":"Any update on this?","inReplyTo":"<w1@x.com>"}"#;

        let IngestOutcome::Stored(a) = f.orchestrator.process_webhook(&channel, first).await.unwrap() else {
            panic!("expected a stored message");
        };
        let IngestOutcome::Stored(b) = f.orchestrator.process_webhook(&channel, second).await.unwrap() else {
            panic!("expected a stored message");
        };
        assert!(a.created_ticket);
        assert!(!b.created_ticket);
        assert_eq!(a.ticket_id, b.ticket_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_workers_fall_back_to_polling() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        f.store
            .add_channel("hooks@acme.test", ProviderKind::Webhook, ChannelSettings::default());
        f.mailbox.push(raw(1, "ada@example.com", "First", ""));
        f.mailbox.queue_idle(IdleEvent::NewMail);

        assert_eq!(f.orchestrator.init_channels().await.unwrap(), 1);
        assert_eq!(f.orchestrator.running_channels(), vec![channel.id]);
        // Already running
        assert_eq!(f.orchestrator.init_channels().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.store.tickets().len(), 1);

        // The push connection has dropped; new mail is picked up by polling
        f.mailbox.push(raw(2, "bob@example.com", "Second", ""));
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(f.store.tickets().len(), 2);
        assert_eq!(watermark(&f.store, &channel), Some(2));

        f.orchestrator.shutdown().await;
        assert!(f.orchestrator.running_channels().is_empty());
        assert!(f.mailbox.logged_out());
    }
}
