//! Remote mailbox access
//!
//! `MailStore` is the seam between the connector and the wire protocol.
//! `ImapMailStore` drives a blocking `imap` session on the blocking pool.

use async_trait::async_trait;
use helpdesk_common::{Error, Result};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;

/// Which messages a fetch returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchCriteria {
    All,
    Unseen,
    /// Messages with a UID strictly greater than the given one
    UidsAbove(u32),
}

impl SearchCriteria {
    fn to_imap_query(self) -> String {
        match self {
            SearchCriteria::All => "ALL".to_string(),
            SearchCriteria::Unseen => "UNSEEN".to_string(),
            SearchCriteria::UidsAbove(uid) => format!("UID {}:*", uid.saturating_add(1)),
        }
    }

    /// Whether a UID satisfies the criteria's UID bound
    pub fn admits(self, uid: u32) -> bool {
        match self {
            SearchCriteria::UidsAbove(watermark) => uid > watermark,
            _ => true,
        }
    }
}

/// A fetched message before parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: u32,
    pub data: Vec<u8>,
}

/// Result of waiting on a push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    NewMail,
    Timeout,
}

/// How to log in to a mailbox
#[derive(Clone)]
pub enum LoginCredential {
    Password { user: String, password: String },
    XOAuth2 { user: String, token: String },
}

impl std::fmt::Debug for LoginCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginCredential::Password { user, .. } => {
                f.debug_struct("Password").field("user", user).finish_non_exhaustive()
            }
            LoginCredential::XOAuth2 { user, .. } => {
                f.debug_struct("XOAuth2").field("user", user).finish_non_exhaustive()
            }
        }
    }
}

/// IMAP server plus login
#[derive(Debug, Clone)]
pub struct MailEndpoint {
    pub host: String,
    pub port: u16,
    pub credential: LoginCredential,
}

/// Operations on one authenticated mailbox
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Fetch up to `limit` messages, ascending by UID
    async fn fetch(&self, folder: &str, criteria: SearchCriteria, limit: usize) -> Result<Vec<RawMessage>>;

    async fn set_seen(&self, folder: &str, uid: u32, seen: bool) -> Result<()>;

    async fn move_message(&self, folder: &str, uid: u32, destination: &str) -> Result<()>;

    async fn delete_message(&self, folder: &str, uid: u32) -> Result<()>;

    /// Cheap liveness probe
    async fn noop(&self) -> Result<()>;

    async fn supports_idle(&self) -> Result<bool>;

    /// Block until the folder changes or `timeout` elapses
    async fn idle_wait(&self, folder: &str, timeout: Duration) -> Result<IdleEvent>;

    async fn logout(&self) -> Result<()>;
}

/// Opens authenticated mailbox sessions
#[async_trait]
pub trait MailStoreOpener: Send + Sync {
    async fn open(&self, endpoint: MailEndpoint) -> Result<Arc<dyn MailStore>>;
}

struct XOAuth2Authenticator {
    user: String,
    access_token: String,
}

impl imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&self, _data: &[u8]) -> Self::Response {
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.access_token)
    }
}

/// Retrieve bodies for `uids` in order, stopping at the first one that cannot
/// be retrieved. Callers advance their watermark over the returned UIDs only,
/// so a stuck message is retried on the next poll instead of being skipped.
pub fn fetch_in_order<F>(uids: &[u32], mut fetch_one: F) -> Result<Vec<RawMessage>>
where
    F: FnMut(u32) -> Result<Option<Vec<u8>>>,
{
    let mut messages = Vec::with_capacity(uids.len());
    for &uid in uids {
        let failure = match fetch_one(uid) {
            Ok(Some(data)) => {
                messages.push(RawMessage { uid, data });
                continue;
            }
            Ok(None) => Error::Connection(format!("UID {} returned no body", uid)),
            Err(e) => e,
        };
        if messages.is_empty() {
            return Err(failure);
        }
        warn!(uid, fetched = messages.len(), error = %failure, "Cutting fetch batch short");
        break;
    }
    Ok(messages)
}

fn connection_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Connection(format!("{}: {}", context, e))
}

fn open_session(endpoint: &MailEndpoint) -> Result<ImapSession> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|e| connection_error("Failed to build TLS connector", e))?;

    let address = (endpoint.host.as_str(), endpoint.port);
    let client = if endpoint.port == 143 {
        imap::connect_starttls(address, endpoint.host.as_str(), &tls)
    } else {
        imap::connect(address, endpoint.host.as_str(), &tls)
    }
    .map_err(|e| {
        connection_error(
            &format!("Failed to connect to {}:{}", endpoint.host, endpoint.port),
            e,
        )
    })?;

    match &endpoint.credential {
        LoginCredential::Password { user, password } => client
            .login(user, password)
            .map_err(|(e, _)| connection_error("IMAP login rejected", e)),
        LoginCredential::XOAuth2 { user, token } => {
            let auth = XOAuth2Authenticator {
                user: user.clone(),
                access_token: token.clone(),
            };
            client
                .authenticate("XOAUTH2", &auth)
                .map_err(|(e, _)| connection_error("IMAP XOAUTH2 authentication rejected", e))
        }
    }
}

/// IMAP-backed mailbox.
///
/// Commands share one session. IDLE runs on a second, lazily opened
/// session so a long wait never blocks fetches or flag updates.
pub struct ImapMailStore {
    endpoint: MailEndpoint,
    session: Arc<Mutex<ImapSession>>,
    idle_session: Arc<Mutex<Option<ImapSession>>>,
}

impl ImapMailStore {
    /// Connect and authenticate
    pub async fn connect(endpoint: MailEndpoint) -> Result<Self> {
        let opened = endpoint.clone();
        let session = tokio::task::spawn_blocking(move || open_session(&opened))
            .await
            .map_err(|e| Error::Internal(format!("IMAP connect task failed: {}", e)))??;

        debug!(host = %endpoint.host, port = endpoint.port, "IMAP session established");

        Ok(Self {
            endpoint,
            session: Arc::new(Mutex::new(session)),
            idle_session: Arc::new(Mutex::new(None)),
        })
    }

    async fn with_session<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T> + Send + 'static,
    {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = session
                .lock()
                .map_err(|_| Error::Internal("IMAP session lock poisoned".to_string()))?;
            op(&mut session)
        })
        .await
        .map_err(|e| Error::Internal(format!("IMAP task failed: {}", e)))?
    }
}

#[async_trait]
impl MailStore for ImapMailStore {
    async fn fetch(&self, folder: &str, criteria: SearchCriteria, limit: usize) -> Result<Vec<RawMessage>> {
        let folder = folder.to_string();
        self.with_session(move |session| {
            session
                .select(&folder)
                .map_err(|e| connection_error(&format!("Failed to select {}", folder), e))?;

            let mut uids: Vec<u32> = session
                .uid_search(criteria.to_imap_query())
                .map_err(|e| connection_error("UID SEARCH failed", e))?
                .into_iter()
                // `n:*` always matches the last message, even below the bound
                .filter(|uid| criteria.admits(*uid))
                .collect();
            uids.sort_unstable();
            uids.truncate(limit);

            fetch_in_order(&uids, |uid| {
                let fetches = session
                    .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
                    .map_err(|e| connection_error("UID FETCH failed", e))?;
                Ok(fetches.iter().find_map(|fetch| fetch.body().map(<[u8]>::to_vec)))
            })
        })
        .await
    }

    async fn set_seen(&self, folder: &str, uid: u32, seen: bool) -> Result<()> {
        let folder = folder.to_string();
        self.with_session(move |session| {
            session
                .select(&folder)
                .map_err(|e| connection_error(&format!("Failed to select {}", folder), e))?;
            let flags = if seen { "+FLAGS (\\Seen)" } else { "-FLAGS (\\Seen)" };
            session
                .uid_store(uid.to_string(), flags)
                .map_err(|e| connection_error("UID STORE failed", e))?;
            Ok(())
        })
        .await
    }

    async fn move_message(&self, folder: &str, uid: u32, destination: &str) -> Result<()> {
        let folder = folder.to_string();
        let destination = destination.to_string();
        self.with_session(move |session| {
            session
                .select(&folder)
                .map_err(|e| connection_error(&format!("Failed to select {}", folder), e))?;
            if session.uid_mv(uid.to_string(), &destination).is_ok() {
                return Ok(());
            }
            // Servers without MOVE: copy, flag deleted, expunge
            session
                .uid_copy(uid.to_string(), &destination)
                .map_err(|e| connection_error("UID COPY failed", e))?;
            session
                .uid_store(uid.to_string(), "+FLAGS.SILENT (\\Deleted)")
                .map_err(|e| connection_error("UID STORE failed", e))?;
            session
                .expunge()
                .map_err(|e| connection_error("EXPUNGE failed", e))?;
            Ok(())
        })
        .await
    }

    async fn delete_message(&self, folder: &str, uid: u32) -> Result<()> {
        let folder = folder.to_string();
        self.with_session(move |session| {
            session
                .select(&folder)
                .map_err(|e| connection_error(&format!("Failed to select {}", folder), e))?;
            session
                .uid_store(uid.to_string(), "+FLAGS.SILENT (\\Deleted)")
                .map_err(|e| connection_error("UID STORE failed", e))?;
            session
                .expunge()
                .map_err(|e| connection_error("EXPUNGE failed", e))?;
            Ok(())
        })
        .await
    }

    async fn noop(&self) -> Result<()> {
        self.with_session(|session| {
            session
                .noop()
                .map_err(|e| connection_error("NOOP failed", e))
        })
        .await
    }

    async fn supports_idle(&self) -> Result<bool> {
        self.with_session(|session| {
            let capabilities = session
                .capabilities()
                .map_err(|e| connection_error("CAPABILITY failed", e))?;
            Ok(capabilities.has_str("IDLE"))
        })
        .await
    }

    async fn idle_wait(&self, folder: &str, timeout: Duration) -> Result<IdleEvent> {
        let folder = folder.to_string();
        let endpoint = self.endpoint.clone();
        let idle_session = self.idle_session.clone();

        tokio::task::spawn_blocking(move || {
            let mut slot = idle_session
                .lock()
                .map_err(|_| Error::Internal("IMAP idle lock poisoned".to_string()))?;
            if slot.is_none() {
                let mut session = open_session(&endpoint)?;
                session
                    .select(&folder)
                    .map_err(|e| connection_error(&format!("Failed to select {}", folder), e))?;
                *slot = Some(session);
            }
            let Some(session) = slot.as_mut() else {
                return Err(Error::Internal("IMAP idle session missing".to_string()));
            };

            let outcome = session
                .idle()
                .and_then(|handle| handle.wait_with_timeout(timeout));
            match outcome {
                Ok(imap::extensions::idle::WaitOutcome::MailboxChanged) => Ok(IdleEvent::NewMail),
                Ok(imap::extensions::idle::WaitOutcome::TimedOut) => Ok(IdleEvent::Timeout),
                Err(e) => {
                    // Drop the broken session; the next wait reopens it
                    *slot = None;
                    Err(connection_error("IDLE failed", e))
                }
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("IMAP idle task failed: {}", e)))?
    }

    async fn logout(&self) -> Result<()> {
        let idle_session = self.idle_session.clone();
        self.with_session(move |session| {
            if let Ok(mut slot) = idle_session.lock() {
                if let Some(mut idle) = slot.take() {
                    idle.logout().ok();
                }
            }
            session
                .logout()
                .map_err(|e| connection_error("LOGOUT failed", e))
        })
        .await
    }
}

/// Opens `ImapMailStore` sessions
pub struct ImapOpener;

#[async_trait]
impl MailStoreOpener for ImapOpener {
    async fn open(&self, endpoint: MailEndpoint) -> Result<Arc<dyn MailStore>> {
        Ok(Arc::new(ImapMailStore::connect(endpoint).await?))
    }
}
