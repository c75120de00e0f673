//! Provider capabilities
//!
//! Each mailbox provider knows its connection endpoints and, for OAuth2
//! providers, how to build the consent URL and talk to the token endpoint.
//! The rest of the pipeline selects a provider by channel configuration
//! and never branches on the provider kind itself.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use helpdesk_common::config::{OAuthClientConfig, OAuthConfig};
use helpdesk_common::types::{ChannelSettings, OAuth2TokenSet, ProviderKind};
use helpdesk_common::{Error, Result};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_SCOPES: &[&str] = &["https://mail.google.com/"];

const MICROSOFT_AUTH_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const MICROSOFT_SCOPES: &[&str] = &[
    "offline_access",
    "https://outlook.office.com/IMAP.AccessAsUser.All",
    "https://outlook.office.com/SMTP.Send",
];

/// Access tokens are treated as expired this long before the provider says so
const EXPIRY_SKEW_SECS: i64 = 60;
/// Longest lifetime honoured from a token endpoint's `expires_in`
const MAX_EXPIRES_IN_SECS: i64 = 365 * 24 * 60 * 60;

/// SMTP transport security
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// Implicit TLS (port 465)
    Tls,
    /// STARTTLS upgrade (port 587)
    StartTls,
    /// Unencrypted, local relays only
    Plain,
}

/// Where a channel's mailbox and relay live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_security: SmtpSecurity,
}

/// Provider capability interface
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// IMAP and SMTP endpoints for a channel
    fn connection_params(&self, settings: &ChannelSettings) -> Result<ConnectionParams>;

    /// Whether the mailbox supports push (IMAP IDLE) notification
    fn supports_idle(&self) -> bool {
        true
    }

    /// Consent screen URL carrying `state`
    fn authorization_url(&self, state: &str) -> Result<String>;

    /// One-time authorization code exchange
    async fn exchange_code(&self, code: &str) -> Result<OAuth2TokenSet>;

    /// Refresh an access token
    async fn refresh(&self, refresh_token: &str) -> Result<OAuth2TokenSet>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Token endpoint client shared by the OAuth2 providers
pub struct OAuthClient {
    http: Client,
    client: OAuthClientConfig,
    auth_url: String,
    token_url: String,
    scopes: Vec<String>,
}

impl OAuthClient {
    fn new(
        http: Client,
        client: OAuthClientConfig,
        default_auth_url: &str,
        default_token_url: &str,
        default_scopes: &[&str],
    ) -> Self {
        let scopes = if client.scopes.is_empty() {
            default_scopes.iter().map(|s| s.to_string()).collect()
        } else {
            client.scopes.clone()
        };
        Self {
            auth_url: client
                .auth_url
                .clone()
                .unwrap_or_else(|| default_auth_url.to_string()),
            token_url: client
                .token_url
                .clone()
                .unwrap_or_else(|| default_token_url.to_string()),
            scopes,
            client,
            http,
        }
    }

    fn authorization_url(&self, state: &str, extra: &[(&str, &str)]) -> Result<String> {
        let scope = self.scopes.join(" ");
        let mut params = vec![
            ("client_id", self.client.client_id.as_str()),
            ("redirect_uri", self.client.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("state", state),
        ];
        params.extend_from_slice(extra);

        let url = Url::parse_with_params(&self.auth_url, &params)
            .map_err(|e| Error::Config(format!("Invalid authorization URL: {}", e)))?;
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuth2TokenSet> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.client.redirect_uri),
            ("client_id", &self.client.client_id),
            ("client_secret", &self.client.client_secret),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OAuth2TokenSet> {
        let mut tokens = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client.client_id),
                ("client_secret", &self.client.client_secret),
            ])
            .await?;

        // Providers may omit the refresh token when it is not rotated
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        Ok(tokens)
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<OAuth2TokenSet> {
        let response = self
            .http
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Token request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Provider(format!("Failed to read token response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Provider(format!(
                "Token endpoint returned {}: {}",
                status, text
            )));
        }

        let json: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Provider(format!("Malformed token response: {}", e)))?;

        debug!(token_url = %self.token_url, expires_in = ?json.expires_in, "Token endpoint succeeded");

        Ok(OAuth2TokenSet {
            access_token: json.access_token,
            refresh_token: json.refresh_token,
            expires_at: json.expires_in.and_then(expiry_from),
        })
    }
}

/// Absolute expiry for a relative `expires_in`, less the refresh skew
fn expiry_from(expires_in: i64) -> Option<chrono::DateTime<Utc>> {
    let secs = expires_in
        .saturating_sub(EXPIRY_SKEW_SECS)
        .clamp(0, MAX_EXPIRES_IN_SECS);
    Duration::try_seconds(secs).and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
}

fn with_overrides(settings: &ChannelSettings, defaults: ConnectionParams) -> ConnectionParams {
    ConnectionParams {
        imap_host: settings.imap_host.clone().unwrap_or(defaults.imap_host),
        imap_port: settings.imap_port.unwrap_or(defaults.imap_port),
        smtp_host: settings.smtp_host.clone().unwrap_or(defaults.smtp_host),
        smtp_port: settings.smtp_port.unwrap_or(defaults.smtp_port),
        smtp_security: defaults.smtp_security,
    }
}

fn not_configured(kind: ProviderKind) -> Error {
    Error::Config(format!("OAuth client for {} is not configured", kind))
}

/// Google Workspace / Gmail
pub struct GmailProvider {
    oauth: Option<OAuthClient>,
}

impl GmailProvider {
    pub fn new(http: Client, client: Option<OAuthClientConfig>) -> Self {
        Self {
            oauth: client.map(|c| {
                OAuthClient::new(http, c, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL, GOOGLE_SCOPES)
            }),
        }
    }

    fn oauth(&self) -> Result<&OAuthClient> {
        self.oauth
            .as_ref()
            .ok_or_else(|| not_configured(ProviderKind::Gmail))
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    fn connection_params(&self, settings: &ChannelSettings) -> Result<ConnectionParams> {
        Ok(with_overrides(
            settings,
            ConnectionParams {
                imap_host: "imap.gmail.com".to_string(),
                imap_port: 993,
                smtp_host: "smtp.gmail.com".to_string(),
                smtp_port: 465,
                smtp_security: SmtpSecurity::Tls,
            },
        ))
    }

    fn authorization_url(&self, state: &str) -> Result<String> {
        // offline access plus forced consent so Google always issues a refresh token
        self.oauth()?
            .authorization_url(state, &[("access_type", "offline"), ("prompt", "consent")])
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuth2TokenSet> {
        self.oauth()?.exchange_code(code).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OAuth2TokenSet> {
        self.oauth()?.refresh(refresh_token).await
    }
}

/// Microsoft 365 / Outlook.com
pub struct OutlookProvider {
    oauth: Option<OAuthClient>,
}

impl OutlookProvider {
    pub fn new(http: Client, client: Option<OAuthClientConfig>) -> Self {
        Self {
            oauth: client.map(|c| {
                OAuthClient::new(http, c, MICROSOFT_AUTH_URL, MICROSOFT_TOKEN_URL, MICROSOFT_SCOPES)
            }),
        }
    }

    fn oauth(&self) -> Result<&OAuthClient> {
        self.oauth
            .as_ref()
            .ok_or_else(|| not_configured(ProviderKind::Outlook))
    }
}

#[async_trait]
impl MailProvider for OutlookProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    fn connection_params(&self, settings: &ChannelSettings) -> Result<ConnectionParams> {
        Ok(with_overrides(
            settings,
            ConnectionParams {
                imap_host: "outlook.office365.com".to_string(),
                imap_port: 993,
                smtp_host: "smtp.office365.com".to_string(),
                smtp_port: 587,
                smtp_security: SmtpSecurity::StartTls,
            },
        ))
    }

    fn authorization_url(&self, state: &str) -> Result<String> {
        self.oauth()?.authorization_url(state, &[("response_mode", "query")])
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuth2TokenSet> {
        self.oauth()?.exchange_code(code).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OAuth2TokenSet> {
        self.oauth()?.refresh(refresh_token).await
    }
}

/// Any IMAP/SMTP server with password login
pub struct GenericImapProvider;

#[async_trait]
impl MailProvider for GenericImapProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    fn connection_params(&self, settings: &ChannelSettings) -> Result<ConnectionParams> {
        let imap_host = settings
            .imap_host
            .clone()
            .ok_or_else(|| Error::Config("Channel has no IMAP host".to_string()))?;
        let smtp_port = settings.smtp_port.unwrap_or(587);
        let smtp_security = match smtp_port {
            465 => SmtpSecurity::Tls,
            25 => SmtpSecurity::Plain,
            _ => SmtpSecurity::StartTls,
        };

        Ok(ConnectionParams {
            smtp_host: settings.smtp_host.clone().unwrap_or_else(|| imap_host.clone()),
            imap_host,
            imap_port: settings.imap_port.unwrap_or(993),
            smtp_port,
            smtp_security,
        })
    }

    fn authorization_url(&self, _state: &str) -> Result<String> {
        Err(Error::Config("Password-based channels have no OAuth flow".to_string()))
    }

    async fn exchange_code(&self, _code: &str) -> Result<OAuth2TokenSet> {
        Err(Error::Config("Password-based channels have no OAuth flow".to_string()))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<OAuth2TokenSet> {
        Err(Error::Auth("Password-based channels have no refresh token".to_string()))
    }
}

/// Providers keyed by kind
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn MailProvider>>,
}

impl ProviderRegistry {
    /// Built-in providers, with OAuth clients from configuration
    pub fn from_config(config: &OAuthConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::default()
            .with(Arc::new(GmailProvider::new(http.clone(), config.google.clone())))
            .with(Arc::new(OutlookProvider::new(http, config.microsoft.clone())))
            .with(Arc::new(GenericImapProvider)))
    }

    pub fn with(mut self, provider: Arc<dyn MailProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn MailProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Config(format!("No mailbox provider for {}", kind)))
    }

    /// Provider serving a channel's configured kind
    pub fn for_channel(&self, channel: &helpdesk_storage::models::Channel) -> Result<Arc<dyn MailProvider>> {
        self.get(channel.provider_kind()?)
    }
}
