//! Credential manager
//!
//! Hands out usable OAuth2 access tokens per channel, refreshing them on
//! demand. Refreshes serialize per channel only; a slow token endpoint for
//! one channel never blocks another.

mod provider;

pub use provider::{
    ConnectionParams, GenericImapProvider, GmailProvider, MailProvider, OAuthClient,
    OutlookProvider, ProviderRegistry, SmtpSecurity,
};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use helpdesk_common::types::{ChannelId, OAuth2TokenSet, ProviderKind};
use helpdesk_common::{Error, Result};
use helpdesk_storage::models::Channel;
use helpdesk_storage::repository::ChannelRepositoryTrait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Correlation carried through the OAuth2 consent redirect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationState {
    pub channel_id: ChannelId,
    pub user_id: Option<Uuid>,
    pub provider: ProviderKind,
}

type HmacSha256 = Hmac<Sha256>;

/// How long a consent redirect stays valid
const STATE_TTL_MINUTES: i64 = 30;

#[derive(Serialize, Deserialize)]
struct StateEnvelope {
    #[serde(flatten)]
    state: AuthorizationState,
    /// Unix seconds
    exp: i64,
}

impl AuthorizationState {
    /// `<base64 payload>.<base64 HMAC-SHA256>`, valid for a limited time
    pub fn encode(&self, key: &[u8]) -> Result<String> {
        let envelope = StateEnvelope {
            state: self.clone(),
            exp: (Utc::now() + Duration::minutes(STATE_TTL_MINUTES)).timestamp(),
        };
        let json = serde_json::to_vec(&envelope).map_err(|e| Error::Internal(e.to_string()))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = URL_SAFE_NO_PAD.encode(state_mac(key, &payload)?.finalize().into_bytes());
        Ok(format!("{}.{}", payload, signature))
    }

    pub fn decode(state: &str, key: &[u8]) -> Result<Self> {
        let (payload, signature) = state
            .trim()
            .split_once('.')
            .ok_or_else(|| Error::Validation("Malformed OAuth state".to_string()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| Error::Validation("Malformed OAuth state".to_string()))?;
        state_mac(key, payload)?
            .verify_slice(&signature)
            .map_err(|_| Error::Auth("OAuth state signature mismatch".to_string()))?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::Validation("Malformed OAuth state".to_string()))?;
        let envelope: StateEnvelope = serde_json::from_slice(&bytes)
            .map_err(|_| Error::Validation("Malformed OAuth state".to_string()))?;
        if envelope.exp < Utc::now().timestamp() {
            return Err(Error::Auth("OAuth state expired".to_string()));
        }
        Ok(envelope.state)
    }
}

fn state_mac(key: &[u8], payload: &str) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Config(format!("Invalid OAuth state key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Credential manager
pub struct CredentialManager {
    channels: Arc<dyn ChannelRepositoryTrait>,
    providers: ProviderRegistry,
    locks: std::sync::Mutex<HashMap<ChannelId, Arc<Mutex<()>>>>,
    state_key: Vec<u8>,
}

impl CredentialManager {
    pub fn new(channels: Arc<dyn ChannelRepositoryTrait>, providers: ProviderRegistry) -> Self {
        Self {
            channels,
            providers,
            locks: std::sync::Mutex::new(HashMap::new()),
            // Per-process key; consent redirects do not survive a restart
            state_key: [Uuid::new_v4().into_bytes(), Uuid::new_v4().into_bytes()].concat(),
        }
    }

    /// Key signing the consent `state`, shared across instances
    pub fn with_state_secret(mut self, secret: &str) -> Self {
        self.state_key = secret.as_bytes().to_vec();
        self
    }

    /// Signed `state` parameter for a consent redirect
    pub fn sign_state(&self, state: &AuthorizationState) -> Result<String> {
        state.encode(&self.state_key)
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    fn channel_lock(&self, channel_id: ChannelId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(channel_id).or_default().clone()
    }

    async fn load_channel(&self, channel_id: ChannelId) -> Result<Channel> {
        self.channels
            .get(channel_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Channel {} not found", channel_id)))
    }

    /// A currently valid access token for the channel.
    ///
    /// Returns the stored token without any network call while it is
    /// unexpired; otherwise refreshes it, persists the new token set and
    /// returns the new access token.
    pub async fn get_valid_access_token(&self, channel_id: ChannelId) -> Result<String> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent caller may have refreshed already
        let channel = self.load_channel(channel_id).await?;
        let tokens = channel.parsed_settings()?.tokens;

        if let Some(tokens) = &tokens {
            if tokens.is_valid_at(Utc::now()) {
                return Ok(tokens.access_token.clone());
            }
        }

        let refresh_token = tokens
            .and_then(|t| t.refresh_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Auth(format!(
                    "Channel {} has no refresh token; re-authorization required",
                    channel_id
                ))
            })?;

        let tokens = self.refresh_with(&channel, &refresh_token).await?;
        Ok(tokens.access_token)
    }

    /// Refresh regardless of the stored expiry
    pub async fn force_refresh(&self, channel_id: ChannelId) -> Result<OAuth2TokenSet> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let channel = self.load_channel(channel_id).await?;
        let refresh_token = channel
            .parsed_settings()?
            .tokens
            .and_then(|t| t.refresh_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Auth(format!(
                    "Channel {} has no refresh token; re-authorization required",
                    channel_id
                ))
            })?;

        self.refresh_with(&channel, &refresh_token).await
    }

    async fn refresh_with(&self, channel: &Channel, refresh_token: &str) -> Result<OAuth2TokenSet> {
        let provider = self.providers.for_channel(channel)?;
        let tokens = match provider.refresh(refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(
                    channel_id = %channel.id,
                    provider = %provider.kind(),
                    error = %e,
                    "Token refresh rejected; channel needs re-authorization"
                );
                return Err(e);
            }
        };

        self.channels.update_tokens(channel.id, &tokens).await?;
        info!(channel_id = %channel.id, expires_at = ?tokens.expires_at, "Refreshed access token");
        Ok(tokens)
    }

    /// Consent screen URL for connecting a channel to an OAuth2 provider
    pub fn build_authorization_url(
        &self,
        provider: ProviderKind,
        channel_id: ChannelId,
        user_id: Option<Uuid>,
    ) -> Result<String> {
        if !provider.is_oauth() {
            return Err(Error::Validation(format!("{} does not use OAuth2", provider)));
        }
        let state = self.sign_state(&AuthorizationState {
            channel_id,
            user_id,
            provider,
        })?;
        self.providers.get(provider)?.authorization_url(&state)
    }

    /// One-time code exchange
    pub async fn exchange_code(&self, provider: ProviderKind, code: &str) -> Result<OAuth2TokenSet> {
        self.providers.get(provider)?.exchange_code(code).await
    }

    /// Finish the consent flow: exchange the code and persist tokens on the
    /// channel named in `state`
    pub async fn complete_authorization(&self, state: &str, code: &str) -> Result<AuthorizationState> {
        let state = AuthorizationState::decode(state, &self.state_key)?;
        let channel = self.load_channel(state.channel_id).await?;
        if channel.provider_kind()? != state.provider {
            return Err(Error::Validation(format!(
                "Channel {} is not a {} channel",
                channel.id, state.provider
            )));
        }

        let tokens = self.exchange_code(state.provider, code).await?;
        if tokens.refresh_token.is_none() {
            warn!(channel_id = %channel.id, "Provider issued no refresh token");
        }

        let lock = self.channel_lock(channel.id);
        let _guard = lock.lock().await;
        self.channels.update_tokens(channel.id, &tokens).await?;

        info!(channel_id = %channel.id, provider = %state.provider, "Channel authorized");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use chrono::Duration;
    use helpdesk_common::config::OAuthClientConfig;
    use helpdesk_common::types::ChannelSettings;
    use pretty_assertions::assert_eq;
    use reqwest::Client;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry(server: &MockServer) -> ProviderRegistry {
        let client = OAuthClientConfig {
            client_id: "client-1".to_string(),
            client_secret: "secret-1".to_string(),
            redirect_uri: "https://helpdesk.test/api/v1/oauth/callback".to_string(),
            auth_url: None,
            token_url: Some(format!("{}/token", server.uri())),
            scopes: Vec::new(),
        };
        ProviderRegistry::default()
            .with(Arc::new(GmailProvider::new(Client::new(), Some(client))))
            .with(Arc::new(GenericImapProvider))
    }

    fn gmail_channel(store: &MemoryStore, tokens: Option<OAuth2TokenSet>) -> Channel {
        store.add_channel(
            "support@acme.test",
            ProviderKind::Gmail,
            ChannelSettings {
                tokens,
                ..Default::default()
            },
        )
    }

    fn token_response(access: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": access,
            "expires_in": 3600
        }))
    }

    #[tokio::test]
    async fn test_valid_token_makes_no_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(token_response("never"))
            .expect(0)
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let channel = gmail_channel(
            &store,
            Some(OAuth2TokenSet {
                access_token: "a-1".to_string(),
                refresh_token: Some("r-1".to_string()),
                expires_at: Some(Utc::now() + Duration::minutes(30)),
            }),
        );
        let manager = CredentialManager::new(store.repositories().channels, registry(&server));

        assert_eq!(manager.get_valid_access_token(channel.id).await.unwrap(), "a-1");
        assert_eq!(store.token_writes(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("a-2"))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let channel = gmail_channel(
            &store,
            Some(OAuth2TokenSet {
                access_token: "a-1".to_string(),
                refresh_token: Some("r-1".to_string()),
                expires_at: Some(Utc::now() - Duration::minutes(1)),
            }),
        );
        let manager = CredentialManager::new(store.repositories().channels, registry(&server));

        let (first, second) = tokio::join!(
            manager.get_valid_access_token(channel.id),
            manager.get_valid_access_token(channel.id)
        );
        assert_eq!(first.unwrap(), "a-2");
        assert_eq!(second.unwrap(), "a-2");
        assert_eq!(store.token_writes(), 1);

        let stored = store.channel(channel.id).parsed_settings().unwrap().tokens.unwrap();
        assert_eq!(stored.access_token, "a-2");
        assert_eq!(stored.refresh_token.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_auth_error() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        let channel = gmail_channel(
            &store,
            Some(OAuth2TokenSet {
                access_token: "a-1".to_string(),
                refresh_token: None,
                expires_at: Some(Utc::now() - Duration::minutes(1)),
            }),
        );
        let manager = CredentialManager::new(store.repositories().channels, registry(&server));

        let err = manager.get_valid_access_token(channel.id).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_revoked_consent_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let channel = gmail_channel(
            &store,
            Some(OAuth2TokenSet {
                access_token: String::new(),
                refresh_token: Some("revoked".to_string()),
                expires_at: None,
            }),
        );
        let manager = CredentialManager::new(store.repositories().channels, registry(&server));

        let err = manager.get_valid_access_token(channel.id).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert_eq!(store.token_writes(), 0);
    }

    #[tokio::test]
    async fn test_authorization_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "a-1",
                "refresh_token": "r-1",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let channel = gmail_channel(&store, None);
        let manager = CredentialManager::new(store.repositories().channels, registry(&server));
        let user_id = Uuid::new_v4();

        let url = manager
            .build_authorization_url(ProviderKind::Gmail, channel.id, Some(user_id))
            .unwrap();
        let url = reqwest::Url::parse(&url).unwrap();
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let completed = manager.complete_authorization(&state, "code-1").await.unwrap();
        assert_eq!(completed.channel_id, channel.id);
        assert_eq!(completed.user_id, Some(user_id));

        let stored = store.channel(channel.id).parsed_settings().unwrap().tokens.unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("r-1"));
    }

    #[test]
    fn test_password_channels_have_no_consent_flow() {
        let store = MemoryStore::new();
        let manager = CredentialManager::new(store.repositories().channels, ProviderRegistry::default());
        assert!(matches!(
            manager.build_authorization_url(ProviderKind::Imap, Uuid::new_v4(), None),
            Err(Error::Validation(_))
        ));
        assert!(AuthorizationState::decode("not base64 !", b"k").is_err());
    }

    #[tokio::test]
    async fn test_forged_state_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "attacker",
                "refresh_token": "attacker",
                "expires_in": 3600
            })))
            .expect(0)
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let channel = gmail_channel(&store, None);
        let manager = CredentialManager::new(store.repositories().channels, registry(&server))
            .with_state_secret("state-key");
        let claim = AuthorizationState {
            channel_id: channel.id,
            user_id: None,
            provider: ProviderKind::Gmail,
        };

        // Unsigned payload naming a known channel
        let bare = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claim).unwrap());
        assert!(manager.complete_authorization(&bare, "code").await.is_err());

        // Signed with someone else's key
        let forged = claim.encode(b"guessed-key").unwrap();
        let err = manager.complete_authorization(&forged, "code").await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));

        // Payload swapped under a genuine signature
        let genuine = manager.sign_state(&claim).unwrap();
        let (_, signature) = genuine.split_once('.').unwrap();
        let other = AuthorizationState {
            channel_id: Uuid::new_v4(),
            ..claim.clone()
        };
        let other = other.encode(b"unused").unwrap();
        let (payload, _) = other.split_once('.').unwrap();
        let swapped = format!("{}.{}", payload, signature);
        assert!(matches!(
            manager.complete_authorization(&swapped, "code").await,
            Err(Error::Auth(_))
        ));

        assert!(store.channel(channel.id).parsed_settings().unwrap().tokens.is_none());
    }
}
