//! Mailbox connector
//!
//! Connects channels to their mailboxes through the provider's
//! connection parameters and the credential manager, fetches and parses
//! messages, mutates flags, and keeps push (IDLE) connections.

mod parser;
mod registry;
mod store;

pub use parser::parse_message;
pub use registry::{ConnectionRegistry, ConnectionState};
pub use store::{
    fetch_in_order, IdleEvent, ImapMailStore, ImapOpener, LoginCredential, MailEndpoint, MailStore,
    MailStoreOpener, RawMessage, SearchCriteria,
};

use crate::credentials::CredentialManager;
use helpdesk_common::types::InboundMessage;
use helpdesk_common::{Error, Result};
use helpdesk_storage::models::Channel;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parsed messages of one fetch
#[derive(Debug, Default)]
pub struct FetchBatch {
    /// Parsed messages, ascending by UID
    pub messages: Vec<InboundMessage>,
    /// UIDs that could not be parsed
    pub unparseable: Vec<u32>,
}

impl FetchBatch {
    /// Highest UID seen in the batch, parsed or not
    pub fn highest_uid(&self) -> Option<u32> {
        self.messages
            .iter()
            .filter_map(|m| m.uid)
            .chain(self.unparseable.iter().copied())
            .max()
    }
}

/// Why a push connection ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The mailbox cannot push; poll instead
    Unsupported,
}

/// Mailbox connector
pub struct MailboxConnector {
    credentials: Arc<CredentialManager>,
    opener: Arc<dyn MailStoreOpener>,
    registry: Arc<ConnectionRegistry>,
}

impl MailboxConnector {
    pub fn new(
        credentials: Arc<CredentialManager>,
        opener: Arc<dyn MailStoreOpener>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            credentials,
            opener,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Connected mailbox for a channel; cached per channel
    pub async fn connect(&self, channel: &Channel) -> Result<Arc<dyn MailStore>> {
        self.registry
            .connect(channel.id, || async {
                let endpoint = self.endpoint(channel).await?;
                debug!(channel_id = %channel.id, host = %endpoint.host, "Opening mailbox");
                self.opener.open(endpoint).await
            })
            .await
    }

    async fn endpoint(&self, channel: &Channel) -> Result<MailEndpoint> {
        let kind = channel.provider_kind()?;
        if !kind.has_mailbox() {
            return Err(Error::Config(format!(
                "Channel {} receives mail by webhook and has no mailbox",
                channel.id
            )));
        }

        let settings = channel.parsed_settings()?;
        let provider = self.credentials.providers().get(kind)?;
        let params = provider.connection_params(&settings)?;
        let user = settings
            .username
            .clone()
            .unwrap_or_else(|| channel.email_address.clone());

        let credential = if kind.is_oauth() {
            let token = self.credentials.get_valid_access_token(channel.id).await?;
            LoginCredential::XOAuth2 { user, token }
        } else {
            let password = settings.password.clone().ok_or_else(|| {
                Error::Auth(format!("Channel {} has no mailbox password", channel.id))
            })?;
            LoginCredential::Password { user, password }
        };

        Ok(MailEndpoint {
            host: params.imap_host,
            port: params.imap_port,
            credential,
        })
    }

    /// Drop the cached connection after a failure so the next call reconnects
    async fn on_failure<T>(&self, channel: &Channel, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if matches!(e, Error::Connection(_)) {
                warn!(channel_id = %channel.id, error = %e, "Mailbox operation failed; closing connection");
                self.registry.close(channel.id).await;
            }
        }
        result
    }

    /// Search, fetch and parse messages
    pub async fn fetch_messages(
        &self,
        channel: &Channel,
        folder: &str,
        criteria: SearchCriteria,
        limit: usize,
    ) -> Result<FetchBatch> {
        let store = self.connect(channel).await?;
        self.registry.set_state(channel.id, ConnectionState::Polling);

        let raw = self
            .on_failure(channel, store.fetch(folder, criteria, limit).await)
            .await?;

        let mut batch = FetchBatch::default();
        for message in raw {
            match parse_message(&message.data, Some(message.uid)) {
                Ok(parsed) => batch.messages.push(parsed),
                Err(e) => {
                    warn!(channel_id = %channel.id, uid = message.uid, error = %e, "Skipping unparseable message");
                    batch.unparseable.push(message.uid);
                }
            }
        }
        batch.messages.sort_by_key(|m| m.uid);

        if self.registry.state(channel.id) == ConnectionState::Polling {
            self.registry.set_state(channel.id, ConnectionState::Connected);
        }
        debug!(
            channel_id = %channel.id,
            folder,
            fetched = batch.messages.len(),
            unparseable = batch.unparseable.len(),
            "Fetched messages"
        );
        Ok(batch)
    }

    pub async fn mark_as_seen(&self, channel: &Channel, folder: &str, uid: u32) -> Result<()> {
        let store = self.connect(channel).await?;
        self.on_failure(channel, store.set_seen(folder, uid, true).await).await
    }

    pub async fn mark_as_unseen(&self, channel: &Channel, folder: &str, uid: u32) -> Result<()> {
        let store = self.connect(channel).await?;
        self.on_failure(channel, store.set_seen(folder, uid, false).await).await
    }

    pub async fn move_message(
        &self,
        channel: &Channel,
        folder: &str,
        uid: u32,
        destination: &str,
    ) -> Result<()> {
        let store = self.connect(channel).await?;
        self.on_failure(channel, store.move_message(folder, uid, destination).await)
            .await
    }

    pub async fn delete_message(&self, channel: &Channel, folder: &str, uid: u32) -> Result<()> {
        let store = self.connect(channel).await?;
        self.on_failure(channel, store.delete_message(folder, uid).await).await
    }

    /// Whether both the provider and the live server support push
    pub async fn supports_idle(&self, channel: &Channel) -> Result<bool> {
        let provider = self.credentials.providers().for_channel(channel)?;
        if !provider.supports_idle() {
            return Ok(false);
        }
        let store = self.connect(channel).await?;
        self.on_failure(channel, store.supports_idle().await).await
    }

    /// Keep a push connection open, calling `on_new_mail` on every change.
    ///
    /// Waits that time out also call `on_new_mail`, so a silently dead push
    /// channel still degrades to periodic fetching. Returns
    /// `IdleOutcome::Unsupported` straight away when push is unavailable,
    /// and an error when the connection fails.
    pub async fn start_idle_connection<F, Fut>(
        &self,
        channel: &Channel,
        folder: &str,
        wait_timeout: Duration,
        mut on_new_mail: F,
    ) -> Result<IdleOutcome>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        if !self.supports_idle(channel).await? {
            info!(channel_id = %channel.id, "Mailbox does not support IDLE");
            return Ok(IdleOutcome::Unsupported);
        }

        let store = self.connect(channel).await?;
        info!(channel_id = %channel.id, folder, "Listening for new mail");

        loop {
            self.registry.set_state(channel.id, ConnectionState::Idle);
            let event = self
                .on_failure(channel, store.idle_wait(folder, wait_timeout).await)
                .await?;

            if event == IdleEvent::NewMail {
                debug!(channel_id = %channel.id, "Mailbox changed");
            }
            on_new_mail().await;
        }
    }

    /// Probe a channel's cached connection
    pub async fn health_check(&self, channel: &Channel) -> bool {
        self.registry.health_check(channel.id).await
    }

    pub async fn disconnect(&self, channel: &Channel) {
        self.registry.close(channel.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ProviderRegistry;
    use crate::testing::{FakeMailbox, FakeOpener, MemoryStore};
    use helpdesk_common::types::{ChannelSettings, OAuth2TokenSet, ProviderKind};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw(uid: u32, subject: &str) -> RawMessage {
        RawMessage {
            uid,
            data: format!(
                "From: a@x.com\r\nMessage-ID: <m{}@x.com>\r\nSubject: {}\r\n\r\nbody {}\r\n",
                uid, subject, uid
            )
            .into_bytes(),
        }
    }

    struct Fixture {
        store: MemoryStore,
        mailbox: Arc<FakeMailbox>,
        opener: Arc<FakeOpener>,
        connector: MailboxConnector,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let mailbox = Arc::new(FakeMailbox::new());
        let opener = Arc::new(FakeOpener::new(mailbox.clone()));
        let providers = ProviderRegistry::from_config(&Default::default()).unwrap();
        let credentials = Arc::new(CredentialManager::new(store.repositories().channels, providers));
        let connector = MailboxConnector::new(
            credentials,
            opener.clone(),
            Arc::new(ConnectionRegistry::new()),
        );
        Fixture {
            store,
            mailbox,
            opener,
            connector,
        }
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

    #[tokio::test]
    async fn test_connect_is_cached_and_uses_password() {
        let f = fixture();
        let channel = imap_channel(&f.store);

        f.connector.connect(&channel).await.unwrap();
        f.connector.connect(&channel).await.unwrap();

        assert_eq!(f.opener.opens(), 1);
        let endpoint = f.opener.last_endpoint().unwrap();
        assert_eq!(endpoint.host, "mail.acme.test");
        assert_eq!(endpoint.port, 993);
        assert!(matches!(
            endpoint.credential,
            LoginCredential::Password { ref user, .. } if user == "support@acme.test"
        ));
    }

    #[tokio::test]
    async fn test_oauth_channel_uses_bearer_token() {
        let f = fixture();
        let channel = f.store.add_channel(
            "help@gmail.test",
            ProviderKind::Gmail,
            ChannelSettings {
                tokens: Some(OAuth2TokenSet {
                    access_token: "a-1".to_string(),
                    refresh_token: None,
                    expires_at: None,
                }),
                ..Default::default()
            },
        );

        f.connector.connect(&channel).await.unwrap();
        let endpoint = f.opener.last_endpoint().unwrap();
        assert_eq!(endpoint.host, "imap.gmail.com");
        assert!(matches!(
            endpoint.credential,
            LoginCredential::XOAuth2 { ref token, .. } if token == "a-1"
        ));
    }

    #[tokio::test]
    async fn test_webhook_channel_has_no_mailbox() {
        let f = fixture();
        let channel = f
            .store
            .add_channel("hooks@acme.test", ProviderKind::Webhook, ChannelSettings::default());
        assert!(matches!(f.connector.connect(&channel).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_fetch_parses_and_skips_garbage() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        f.mailbox.push(raw(3, "Third"));
        f.mailbox.push(RawMessage {
            uid: 4,
            data: b"Subject: no sender\r\n\r\nx".to_vec(),
        });
        f.mailbox.push(raw(2, "Second"));

        let batch = f
            .connector
            .fetch_messages(&channel, "INBOX", SearchCriteria::UidsAbove(1), 10)
            .await
            .unwrap();

        let ids: Vec<&str> = batch.messages.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m2@x.com", "m3@x.com"]);
        assert_eq!(batch.unparseable, vec![4]);
        assert_eq!(batch.highest_uid(), Some(4));
    }

    #[tokio::test]
    async fn test_connection_failure_drops_cached_connection() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        f.connector.connect(&channel).await.unwrap();
        f.mailbox.set_broken(true);

        let result = f
            .connector
            .fetch_messages(&channel, "INBOX", SearchCriteria::All, 10)
            .await;
        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(
            f.connector.registry().state(channel.id),
            ConnectionState::Disconnected
        );

        f.mailbox.set_broken(false);
        f.connector
            .fetch_messages(&channel, "INBOX", SearchCriteria::All, 10)
            .await
            .unwrap();
        assert_eq!(f.opener.opens(), 2);
    }

    #[tokio::test]
    async fn test_flag_operations() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        f.mailbox.push(raw(5, "Flags"));

        f.connector.mark_as_seen(&channel, "INBOX", 5).await.unwrap();
        assert!(f.mailbox.is_seen(5));
        f.connector.mark_as_unseen(&channel, "INBOX", 5).await.unwrap();
        assert!(!f.mailbox.is_seen(5));
        f.connector
            .move_message(&channel, "INBOX", 5, "Archive")
            .await
            .unwrap();
        assert_eq!(f.mailbox.moved(), vec![(5, "Archive".to_string())]);
        f.connector.delete_message(&channel, "INBOX", 5).await.unwrap();
        assert!(f.mailbox.is_empty());
    }

    #[tokio::test]
    async fn test_idle_unsupported_falls_back() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        f.mailbox.set_idle_supported(false);

        let outcome = f
            .connector
            .start_idle_connection(&channel, "INBOX", Duration::from_secs(1), || async {})
            .await
            .unwrap();
        assert_eq!(outcome, IdleOutcome::Unsupported);
    }

    #[tokio::test]
    async fn test_idle_invokes_callback_until_connection_drops() {
        let f = fixture();
        let channel = imap_channel(&f.store);
        f.mailbox.queue_idle(IdleEvent::NewMail);
        f.mailbox.queue_idle(IdleEvent::Timeout);
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        let result = f
            .connector
            .start_idle_connection(&channel, "INBOX", Duration::from_secs(1), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
