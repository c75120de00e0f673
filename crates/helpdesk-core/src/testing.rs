//! In-memory repositories for unit tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helpdesk_common::types::{
    AttachmentId, ChannelId, ChannelSettings, ChannelStatus, ConversationId, MessageId,
    OAuth2TokenSet, ProviderKind, TicketId, TicketStatus,
};
use helpdesk_common::{Error, Result};
use helpdesk_storage::models::{
    Attachment, Channel, Conversation, CreateAttachment, CreateMessage, CreateSpamLog,
    CreateTicket, Message, OpeningMessage, SpamLog, Ticket,
};
use helpdesk_storage::repository::{
    AttachmentRepositoryTrait, ChannelRepositoryTrait, MessageRepositoryTrait, Repositories,
    SpamLogRepositoryTrait, TicketRepositoryTrait,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::mailbox::{
    fetch_in_order, IdleEvent, MailEndpoint, MailStore, MailStoreOpener, RawMessage, SearchCriteria,
};
use crate::outbound::{MailTransport, TransportFactory};

#[derive(Default)]
struct State {
    channels: Vec<Channel>,
    tickets: Vec<Ticket>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    attachments: Vec<Attachment>,
    spam_logs: Vec<SpamLog>,
    token_writes: usize,
    reject_message_writes: bool,
}

/// Shared in-memory datastore implementing every repository trait
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repositories(&self) -> Repositories {
        Repositories {
            channels: Arc::new(self.clone()),
            tickets: Arc::new(self.clone()),
            messages: Arc::new(self.clone()),
            attachments: Arc::new(self.clone()),
            spam_logs: Arc::new(self.clone()),
        }
    }

    pub fn add_channel(&self, address: &str, provider: ProviderKind, settings: ChannelSettings) -> Channel {
        let now = Utc::now();
        let channel = Channel {
            id: Uuid::new_v4(),
            name: address.to_string(),
            email_address: address.to_string(),
            provider: provider.to_string(),
            status: "active".to_string(),
            active: true,
            settings: serde_json::to_value(settings).unwrap(),
            created_at: now,
            updated_at: now,
        };
        self.state.lock().unwrap().channels.push(channel.clone());
        channel
    }

    pub fn insert_ticket(
        &self,
        channel_id: ChannelId,
        subject: &str,
        requester: &str,
        status: TicketStatus,
        created_at: DateTime<Utc>,
    ) -> (Ticket, Conversation) {
        let mut state = self.state.lock().unwrap();
        let ticket = Ticket {
            id: Uuid::new_v4(),
            number: state.tickets.len() as i64 + 1,
            channel_id,
            subject: subject.to_string(),
            status: status.as_str().to_string(),
            priority: "normal".to_string(),
            requester_email: requester.to_string(),
            is_spam: false,
            spam_at: None,
            created_at,
            updated_at: created_at,
        };
        let conversation = Conversation {
            id: Uuid::new_v4(),
            ticket_id: ticket.id,
            channel_id,
            external_thread_id: None,
            reference_ids: serde_json::json!([]),
            created_at,
        };
        state.tickets.push(ticket.clone());
        state.conversations.push(conversation.clone());
        (ticket, conversation)
    }

    pub fn insert_message(
        &self,
        conversation: &Conversation,
        external_id: Option<&str>,
        from: &str,
        subject: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Message {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            ticket_id: conversation.ticket_id,
            channel_id: conversation.channel_id,
            external_message_id: external_id.map(str::to_string),
            in_reply_to: None,
            reference_ids: serde_json::json!([]),
            subject: subject.map(str::to_string),
            from_address: from.to_string(),
            sender_type: "customer".to_string(),
            content: String::new(),
            content_type: "text/plain".to_string(),
            metadata: serde_json::json!({}),
            created_at,
        };
        self.state.lock().unwrap().messages.push(message.clone());
        message
    }

    pub fn set_ticket_spam(&self, id: TicketId) {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.tickets.iter_mut().find(|t| t.id == id) {
            t.is_spam = true;
            t.spam_at = Some(Utc::now());
        }
    }

    pub fn channel(&self, id: ChannelId) -> Channel {
        self.state
            .lock()
            .unwrap()
            .channels
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .unwrap()
    }

    pub fn ticket(&self, id: TicketId) -> Ticket {
        self.state
            .lock()
            .unwrap()
            .tickets
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .unwrap()
    }

    /// Make message inserts fail, as a datastore outage would
    pub fn reject_message_writes(&self, reject: bool) {
        self.state.lock().unwrap().reject_message_writes = reject;
    }

    fn check_message_write(&self) -> Result<()> {
        if self.state.lock().unwrap().reject_message_writes {
            Err(Error::Persistence("message insert rejected".to_string()))
        } else {
            Ok(())
        }
    }

    fn push_message(&self, input: CreateMessage) -> Message {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: input.conversation_id,
            ticket_id: input.ticket_id,
            channel_id: input.channel_id,
            external_message_id: input.external_message_id,
            in_reply_to: input.in_reply_to,
            reference_ids: serde_json::to_value(input.reference_ids).unwrap(),
            subject: input.subject,
            from_address: input.from_address,
            sender_type: input.sender_type.as_str().to_string(),
            content: input.content,
            content_type: input.content_type,
            metadata: input.metadata,
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().messages.push(message.clone());
        message
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.state.lock().unwrap().tickets.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.state.lock().unwrap().attachments.clone()
    }

    pub fn spam_logs(&self) -> Vec<SpamLog> {
        self.state.lock().unwrap().spam_logs.clone()
    }

    pub fn token_writes(&self) -> usize {
        self.state.lock().unwrap().token_writes
    }

    fn update_channel<F: FnOnce(&mut Channel)>(&self, id: ChannelId, f: F) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let channel = state
            .channels
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(format!("Channel {} not found", id)))?;
        f(channel);
        channel.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ChannelRepositoryTrait for MemoryStore {
    async fn list_active(&self) -> Result<Vec<Channel>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .channels
            .iter()
            .filter(|c| c.active)
            .cloned()
            .collect())
    }

    async fn get(&self, id: ChannelId) -> Result<Option<Channel>> {
        Ok(self.state.lock().unwrap().channels.iter().find(|c| c.id == id).cloned())
    }

    async fn find_by_address(&self, address: &str) -> Result<Option<Channel>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .channels
            .iter()
            .find(|c| c.active && c.email_address.eq_ignore_ascii_case(address))
            .cloned())
    }

    async fn update_settings(&self, id: ChannelId, settings: &ChannelSettings) -> Result<()> {
        let value = serde_json::to_value(settings).unwrap();
        self.update_channel(id, |c| c.settings = value)
    }

    async fn update_tokens(&self, id: ChannelId, tokens: &OAuth2TokenSet) -> Result<()> {
        let value = serde_json::to_value(tokens).unwrap();
        self.update_channel(id, |c| c.settings["tokens"] = value)?;
        self.state.lock().unwrap().token_writes += 1;
        Ok(())
    }

    async fn update_watermark(&self, id: ChannelId, uid: u32) -> Result<()> {
        self.update_channel(id, |c| {
            let current = c.settings["watermark"].as_u64().unwrap_or(0);
            if u64::from(uid) >= current {
                c.settings["watermark"] = serde_json::json!(uid);
            }
        })
    }

    async fn set_status(&self, id: ChannelId, status: ChannelStatus) -> Result<()> {
        self.update_channel(id, |c| c.status = status.as_str().to_string())
    }
}

#[async_trait]
impl TicketRepositoryTrait for MemoryStore {
    async fn create_with_conversation(
        &self,
        input: CreateTicket,
        opening: OpeningMessage,
    ) -> Result<(Ticket, Conversation, Message)> {
        // All or nothing, like the database transaction
        self.check_message_write()?;
        let (ticket, conversation) = self.insert_ticket(
            input.channel_id,
            &input.subject,
            &input.requester_email,
            input.status,
            Utc::now(),
        );
        let mut state = self.state.lock().unwrap();
        let ticket = {
            let t = state.tickets.iter_mut().find(|t| t.id == ticket.id).unwrap();
            t.priority = input.priority;
            if input.is_spam {
                t.is_spam = true;
                t.spam_at = Some(Utc::now());
            }
            t.clone()
        };
        let conversation = {
            let c = state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation.id)
                .unwrap();
            c.external_thread_id = input.external_thread_id;
            c.reference_ids = serde_json::to_value(input.reference_ids).unwrap();
            c.clone()
        };
        drop(state);
        let message = self.push_message(opening.into_create(ticket.id, conversation.id, ticket.channel_id));
        Ok((ticket, conversation, message))
    }

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>> {
        Ok(self.state.lock().unwrap().tickets.iter().find(|t| t.id == id).cloned())
    }

    async fn conversation_for_ticket(&self, ticket_id: TicketId) -> Result<Option<Conversation>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .conversations
            .iter()
            .find(|c| c.ticket_id == ticket_id)
            .cloned())
    }

    async fn update_status(&self, id: TicketId, status: TicketStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.tickets.iter_mut().find(|t| t.id == id) {
            t.status = status.as_str().to_string();
        }
        Ok(())
    }

    async fn mark_spam(&self, id: TicketId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.tickets.iter_mut().find(|t| t.id == id) {
            t.is_spam = true;
            t.spam_at.get_or_insert_with(Utc::now);
            t.status = "closed".to_string();
        }
        Ok(())
    }

    async fn list_created_since(&self, since: DateTime<Utc>) -> Result<Vec<Ticket>> {
        let mut tickets: Vec<Ticket> = self
            .state
            .lock()
            .unwrap()
            .tickets
            .iter()
            .filter(|t| t.created_at >= since)
            .cloned()
            .collect();
        tickets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tickets)
    }

    async fn append_reference(&self, conversation_id: ConversationId, message_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.conversations.iter_mut().find(|c| c.id == conversation_id) {
            let mut refs: Vec<String> = serde_json::from_value(c.reference_ids.clone()).unwrap();
            if !refs.iter().any(|r| r == message_id) {
                refs.push(message_id.to_string());
            }
            c.reference_ids = serde_json::to_value(refs).unwrap();
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepositoryTrait for MemoryStore {
    async fn create(&self, input: CreateMessage) -> Result<Message> {
        self.check_message_write()?;
        Ok(self.push_message(input))
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.state.lock().unwrap().messages.iter().find(|m| m.id == id).cloned())
    }

    async fn find_by_external_ids(&self, ids: &[String]) -> Result<Option<Message>> {
        let state = self.state.lock().unwrap();
        Ok(ids.iter().find_map(|id| {
            state
                .messages
                .iter()
                .find(|m| m.external_message_id.as_deref() == Some(id.as_str()))
                .cloned()
        }))
    }

    async fn external_id_exists(&self, channel_id: ChannelId, external_id: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().messages.iter().any(|m| {
            m.channel_id == channel_id && m.external_message_id.as_deref() == Some(external_id)
        }))
    }

    async fn list_by_conversation(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn has_participant(&self, conversation_id: ConversationId, address: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().messages.iter().any(|m| {
            m.conversation_id == conversation_id && m.from_address.eq_ignore_ascii_case(address)
        }))
    }

    async fn list_orphans_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.created_at >= since && m.sender_type == "customer" && m.is_orphan())
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn update_threading(
        &self,
        id: MessageId,
        in_reply_to: Option<&str>,
        references: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(m) = state.messages.iter_mut().find(|m| m.id == id) {
            m.in_reply_to = in_reply_to.map(str::to_string);
            m.reference_ids = serde_json::to_value(references).unwrap();
            m.metadata["threading_inferred"] = serde_json::json!(true);
        }
        Ok(())
    }

    async fn merge_metadata(&self, id: MessageId, patch: serde_json::Value) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let (Some(m), Some(patch)) = (
            state.messages.iter_mut().find(|m| m.id == id),
            patch.as_object(),
        ) {
            for (k, v) in patch {
                m.metadata[k] = v.clone();
            }
        }
        Ok(())
    }

    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.created_at < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AttachmentRepositoryTrait for MemoryStore {
    async fn create(&self, input: CreateAttachment) -> Result<Attachment> {
        let attachment = Attachment {
            id: Uuid::new_v4(),
            message_id: input.message_id,
            filename: input.filename,
            content_type: input.content_type,
            size: input.size,
            storage_path: input.storage_path,
            url: input.url,
            checksum: input.checksum,
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().attachments.push(attachment.clone());
        Ok(attachment)
    }

    async fn get(&self, id: AttachmentId) -> Result<Option<Attachment>> {
        Ok(self.state.lock().unwrap().attachments.iter().find(|a| a.id == id).cloned())
    }

    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<Attachment>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .attachments
            .iter()
            .find(|a| a.checksum == checksum)
            .cloned())
    }

    async fn list_by_message(&self, message_id: MessageId) -> Result<Vec<Attachment>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .attachments
            .iter()
            .filter(|a| a.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn count_by_path(&self, storage_path: &str) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .attachments
            .iter()
            .filter(|a| a.storage_path == storage_path)
            .count() as i64)
    }

    async fn delete(&self, id: AttachmentId) -> Result<()> {
        self.state.lock().unwrap().attachments.retain(|a| a.id != id);
        Ok(())
    }
}

#[async_trait]
impl SpamLogRepositoryTrait for MemoryStore {
    async fn record(&self, input: CreateSpamLog) -> Result<SpamLog> {
        let log = SpamLog {
            id: Uuid::new_v4(),
            ticket_id: input.ticket_id,
            message_id: input.message_id,
            channel_id: input.channel_id,
            is_spam: input.is_spam,
            score: input.score,
            matched_rules: serde_json::to_value(input.matched_rules).unwrap(),
            report: input.report,
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().spam_logs.push(log.clone());
        Ok(log)
    }
}

#[derive(Default)]
struct MailboxState {
    messages: Vec<RawMessage>,
    seen: HashSet<u32>,
    moved: Vec<(u32, String)>,
    idle_events: VecDeque<IdleEvent>,
    idle_unsupported: bool,
    broken: bool,
    logged_out: bool,
    fetches: usize,
    unretrievable: HashSet<u32>,
}

/// Scriptable in-memory mailbox
#[derive(Default)]
pub struct FakeMailbox {
    state: Mutex<MailboxState>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: RawMessage) {
        self.state.lock().unwrap().messages.push(message);
    }

    /// Make the next retrieval of `uid` fail
    pub fn fail_fetch_once(&self, uid: u32) {
        self.state.lock().unwrap().unretrievable.insert(uid);
    }

    pub fn set_broken(&self, broken: bool) {
        self.state.lock().unwrap().broken = broken;
    }

    pub fn set_idle_supported(&self, supported: bool) {
        self.state.lock().unwrap().idle_unsupported = !supported;
    }

    pub fn queue_idle(&self, event: IdleEvent) {
        self.state.lock().unwrap().idle_events.push_back(event);
    }

    pub fn is_seen(&self, uid: u32) -> bool {
        self.state.lock().unwrap().seen.contains(&uid)
    }

    pub fn moved(&self) -> Vec<(u32, String)> {
        self.state.lock().unwrap().moved.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().messages.is_empty()
    }

    pub fn logged_out(&self) -> bool {
        self.state.lock().unwrap().logged_out
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    fn check(&self) -> Result<()> {
        if self.state.lock().unwrap().broken {
            Err(Error::Connection("connection reset".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MailStore for FakeMailbox {
    async fn fetch(&self, _folder: &str, criteria: SearchCriteria, limit: usize) -> Result<Vec<RawMessage>> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        let mut uids: Vec<u32> = state
            .messages
            .iter()
            .filter(|m| criteria.admits(m.uid))
            .filter(|m| criteria != SearchCriteria::Unseen || !state.seen.contains(&m.uid))
            .map(|m| m.uid)
            .collect();
        uids.sort_unstable();
        uids.truncate(limit);

        let state = &mut *state;
        fetch_in_order(&uids, |uid| {
            if state.unretrievable.remove(&uid) {
                return Err(Error::Connection(format!("UID {} fetch failed", uid)));
            }
            Ok(state
                .messages
                .iter()
                .find(|m| m.uid == uid)
                .map(|m| m.data.clone()))
        })
    }

    async fn set_seen(&self, _folder: &str, uid: u32, seen: bool) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if seen {
            state.seen.insert(uid);
        } else {
            state.seen.remove(&uid);
        }
        Ok(())
    }

    async fn move_message(&self, _folder: &str, uid: u32, destination: &str) -> Result<()> {
        self.check()?;
        self.state.lock().unwrap().moved.push((uid, destination.to_string()));
        Ok(())
    }

    async fn delete_message(&self, _folder: &str, uid: u32) -> Result<()> {
        self.check()?;
        self.state.lock().unwrap().messages.retain(|m| m.uid != uid);
        Ok(())
    }

    async fn noop(&self) -> Result<()> {
        self.check()
    }

    async fn supports_idle(&self) -> Result<bool> {
        self.check()?;
        Ok(!self.state.lock().unwrap().idle_unsupported)
    }

    async fn idle_wait(&self, _folder: &str, _timeout: Duration) -> Result<IdleEvent> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .idle_events
            .pop_front()
            .ok_or_else(|| Error::Connection("idle connection closed".to_string()))
    }

    async fn logout(&self) -> Result<()> {
        self.state.lock().unwrap().logged_out = true;
        Ok(())
    }
}

/// Opener handing out one shared `FakeMailbox`
pub struct FakeOpener {
    mailbox: Arc<FakeMailbox>,
    endpoints: Mutex<Vec<MailEndpoint>>,
}

impl FakeOpener {
    pub fn new(mailbox: Arc<FakeMailbox>) -> Self {
        Self {
            mailbox,
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn opens(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    pub fn last_endpoint(&self) -> Option<MailEndpoint> {
        self.endpoints.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MailStoreOpener for FakeOpener {
    async fn open(&self, endpoint: MailEndpoint) -> Result<Arc<dyn MailStore>> {
        self.endpoints.lock().unwrap().push(endpoint);
        Ok(self.mailbox.clone())
    }
}

#[derive(Default)]
struct TransportState {
    failures: VecDeque<Error>,
    sent: Vec<String>,
    attempts: usize,
    verifications: usize,
    unhealthy: bool,
}

/// Scriptable outbound transport recording formatted messages
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<TransportState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next send attempt
    pub fn fail_next(&self, error: Error) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().unwrap().unhealthy = !healthy;
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub fn verifications(&self) -> usize {
        self.state.lock().unwrap().verifications
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn verify(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.verifications += 1;
        Ok(!state.unhealthy)
    }

    async fn send(&self, message: lettre::Message) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.sent.push(String::from_utf8_lossy(&message.formatted()).into_owned());
        Ok(())
    }
}

/// Factory handing out one shared `FakeTransport`
pub struct FakeTransportFactory {
    transport: Arc<FakeTransport>,
    builds: AtomicUsize,
    build_failures: Mutex<VecDeque<Error>>,
}

impl FakeTransportFactory {
    pub fn new(transport: Arc<FakeTransport>) -> Self {
        Self {
            transport,
            builds: AtomicUsize::new(0),
            build_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue an error for the next `build`
    pub fn fail_next_build(&self, error: Error) {
        self.build_failures.lock().unwrap().push_back(error);
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn build(&self, _channel: &Channel) -> Result<Arc<dyn MailTransport>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.build_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self.transport.clone())
    }
}
