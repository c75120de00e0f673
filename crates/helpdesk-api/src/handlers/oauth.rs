//! OAuth2 consent flow handlers

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use helpdesk_common::types::{ChannelId, ProviderKind};
use helpdesk_common::Error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{error_response, ApiError};
use crate::auth::AppState;

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    /// Set by the provider when consent was denied
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub success: bool,
    pub channel_id: ChannelId,
    pub provider: ProviderKind,
}

/// Redirect to the provider's consent screen
///
/// GET /api/v1/oauth/:provider/authorize?channel_id=&user_id=
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, ApiError> {
    let kind = ProviderKind::from_oauth_name(&provider).ok_or_else(|| {
        error_response(Error::Validation(format!(
            "Unknown OAuth provider: {}",
            provider
        )))
    })?;

    state
        .repos
        .channels
        .get(query.channel_id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| {
            error_response(Error::NotFound(format!(
                "Channel {} not found",
                query.channel_id
            )))
        })?;

    let url = state
        .credentials
        .build_authorization_url(kind, query.channel_id, query.user_id)
        .map_err(error_response)?;

    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}

/// Exchange the authorization code and store tokens on the channel
///
/// GET /api/v1/oauth/callback?code=&state=
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<CallbackResponse>, ApiError> {
    if let Some(error) = query.error {
        let detail = query.error_description.unwrap_or_default();
        return Err(error_response(Error::Auth(format!(
            "Authorization denied by provider: {} {}",
            error, detail
        ))));
    }

    let (code, oauth_state) = match (query.code, query.state) {
        (Some(code), Some(oauth_state)) if !code.is_empty() => (code, oauth_state),
        _ => {
            return Err(error_response(Error::Validation(
                "code and state are required".to_string(),
            )))
        }
    };

    let authorized = state
        .credentials
        .complete_authorization(&oauth_state, &code)
        .await
        .map_err(error_response)?;

    Ok(Json(CallbackResponse {
        success: true,
        channel_id: authorized.channel_id,
        provider: authorized.provider,
    }))
}

#[cfg(test)]
mod tests {
    use crate::test_support::{app, app_with, Options};
    use axum::http::StatusCode;
    use helpdesk_common::config::{OAuthClientConfig, OAuthConfig};
    use helpdesk_common::types::{ChannelSettings, ProviderKind};
    use helpdesk_core::AuthorizationState;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn google(token_url: Option<String>) -> OAuthConfig {
        OAuthConfig {
            google: Some(OAuthClientConfig {
                client_id: "client-1".to_string(),
                client_secret: "secret-1".to_string(),
                redirect_uri: "https://helpdesk.test/api/v1/oauth/callback".to_string(),
                auth_url: Some("https://consent.test/auth".to_string()),
                token_url,
                scopes: Vec::new(),
            }),
            microsoft: None,
            state_secret: None,
        }
    }

    #[tokio::test]
    async fn test_authorize_redirects_to_consent() {
        let app = app_with(Options {
            oauth: google(None),
            ..Options::default()
        });
        let channel = app
            .store
            .add_channel("support@acme.test", ProviderKind::Gmail, ChannelSettings::default());

        let response = app
            .server
            .get("/api/v1/oauth/google/authorize")
            .add_query_param("channel_id", channel.id)
            .await;
        assert_eq!(response.status_code(), StatusCode::FOUND);
        let location = response.header("location");
        let location = location.to_str().unwrap();
        assert!(location.starts_with("https://consent.test/auth?"));
        assert!(location.contains("client_id=client-1"));
        assert!(location.contains("state="));
    }

    #[tokio::test]
    async fn test_authorize_rejects_unknown_provider() {
        let app = app();
        let response = app
            .server
            .get("/api/v1/oauth/yahoo/authorize")
            .add_query_param("channel_id", uuid::Uuid::new_v4())
            .await;
        assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_callback_persists_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=one-time"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-1",
                "refresh_token": "refresh-1",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let app = app_with(Options {
            oauth: google(Some(format!("{}/token", server.uri()))),
            ..Options::default()
        });
        let channel = app
            .store
            .add_channel("support@acme.test", ProviderKind::Gmail, ChannelSettings::default());
        let state = app
            .credentials
            .sign_state(&AuthorizationState {
                channel_id: channel.id,
                user_id: None,
                provider: ProviderKind::Gmail,
            })
            .unwrap();

        let response = app
            .server
            .get("/api/v1/oauth/callback")
            .add_query_param("code", "one-time")
            .add_query_param("state", &state)
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["channelId"], channel.id.to_string());

        let settings = app.store.channel(channel.id).parsed_settings().unwrap();
        let tokens = settings.tokens.unwrap();
        assert_eq!(tokens.access_token, "access-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_callback_reports_denied_consent() {
        let app = app();
        let response = app
            .server
            .get("/api/v1/oauth/callback")
            .add_query_param("error", "access_denied")
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

        let response = app
            .server
            .get("/api/v1/oauth/callback")
            .add_query_param("state", "abc")
            .await;
        assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_callback_rejects_unsigned_state() {
        let app = app_with(Options {
            oauth: google(Some("http://127.0.0.1:9/token".to_string())),
            ..Options::default()
        });
        let channel = app
            .store
            .add_channel("support@acme.test", ProviderKind::Gmail, ChannelSettings::default());
        let forged = AuthorizationState {
            channel_id: channel.id,
            user_id: None,
            provider: ProviderKind::Gmail,
        }
        .encode(b"not-the-server-key")
        .unwrap();

        let response = app
            .server
            .get("/api/v1/oauth/callback")
            .add_query_param("code", "attacker-code")
            .add_query_param("state", &forged)
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
        assert!(app.store.channel(channel.id).parsed_settings().unwrap().tokens.is_none());
    }
}
