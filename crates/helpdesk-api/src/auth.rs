//! Authentication module

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use helpdesk_core::{
    AttachmentHandler, CredentialManager, IngestionMetrics, IngestionOrchestrator,
    OutboundService,
};
use helpdesk_storage::{LocalStorage, Repositories};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    pub orchestrator: Arc<IngestionOrchestrator>,
    pub outbound: Arc<OutboundService>,
    pub credentials: Arc<CredentialManager>,
    pub attachments: Arc<AttachmentHandler>,
    /// Serves and verifies signed download URLs
    pub files: Arc<LocalStorage>,
    pub metrics: Arc<IngestionMetrics>,
    /// Hash of the API token; protected routes are open when unset
    pub api_token_hash: Option<String>,
    pub cors_origins: Vec<String>,
    /// Body limit for routes that carry base64 attachments
    pub max_body_bytes: usize,
}

/// Extract API token from request
pub fn extract_api_key(req: &Request) -> Option<&str> {
    // Check Authorization header
    if let Some(auth) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.trim());
            }
        }
    }

    // Check X-API-Key header
    if let Some(key) = req.headers().get("x-api-key") {
        if let Ok(key_str) = key.to_str() {
            return Some(key_str.trim());
        }
    }

    None
}

/// Hash an API token for comparison
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify an API token against a stored hash.
///
/// Accepts Argon2 PHC strings (`$argon2...`) and SHA-256 hex digests.
pub fn verify_api_key(api_key: &str, stored_hash: &str) -> bool {
    if stored_hash.starts_with("$argon2") {
        return PasswordHash::new(stored_hash)
            .ok()
            .and_then(|parsed_hash| {
                Argon2::default()
                    .verify_password(api_key.as_bytes(), &parsed_hash)
                    .ok()
            })
            .is_some();
    }

    hash_api_key(api_key).eq_ignore_ascii_case(stored_hash.trim())
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(stored_hash) = state.api_token_hash.as_deref() else {
        return Ok(next.run(request).await);
    };

    let api_key = extract_api_key(&request).ok_or_else(|| {
        warn!("Missing API token in request to {}", request.uri().path());
        StatusCode::UNAUTHORIZED
    })?;

    if !verify_api_key(api_key, stored_hash) {
        warn!("Invalid API token in request to {}", request.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    debug!(path = %request.uri().path(), "API token accepted");
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::verify_api_key;
    use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
    use argon2::Argon2;
    use sha2::{Digest, Sha256};

    #[test]
    fn verifies_sha256_hash() {
        let api_key = "hd_test_key";
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        let digest = hex::encode(hasher.finalize());

        assert!(verify_api_key(api_key, &digest));
        assert!(verify_api_key(api_key, &digest.to_uppercase()));
        assert!(!verify_api_key("wrong_key", &digest));
    }

    #[test]
    fn verifies_argon2_hash() {
        let api_key = "hd_test_argon2_key";
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(api_key.as_bytes(), &salt)
            .expect("argon2 hash generation should succeed")
            .to_string();

        assert!(verify_api_key(api_key, &hash));
        assert!(!verify_api_key("wrong_key", &hash));
    }
}
