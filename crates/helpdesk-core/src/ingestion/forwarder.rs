//! Ticket forwarder - notifies an external endpoint of ingested mail

use chrono::Utc;
use helpdesk_common::types::{ChannelId, ConversationId, InboundMessage, MessageId, TicketId};
use helpdesk_common::{Error, Result};
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use serde::Serialize;
use sha2::Sha256;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Circuit breaker state for the forward target
#[derive(Debug, Clone, Default)]
struct CircuitBreakerState {
    failure_count: u32,
    last_failure: Option<chrono::DateTime<Utc>>,
    is_open: bool,
}

/// Body posted for every ingested message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardPayload<'a> {
    pub event: &'static str,
    pub channel_id: ChannelId,
    pub ticket_id: TicketId,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub created_ticket: bool,
    pub reopened: bool,
    pub is_spam: bool,
    pub spam_score: f64,
    pub message: &'a InboundMessage,
}

/// Ticket forwarder
pub struct TicketForwarder {
    http_client: Client,
    url: Url,
    secret: Option<String>,
    circuit: RwLock<CircuitBreakerState>,
    /// Maximum consecutive failures before circuit opens
    circuit_threshold: u32,
    /// Time to wait before retrying after circuit opens
    circuit_reset_timeout: Duration,
}

impl TicketForwarder {
    /// Forwarder for `url`; private and internal targets are refused
    /// unless `allow_private` is set
    pub fn new(url: &str, secret: Option<String>, allow_private: bool) -> Result<Self> {
        let url = if allow_private {
            parse_http_url(url)?
        } else {
            validate_webhook_url(url)?
        };
        let http_client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url,
            secret,
            circuit: RwLock::new(CircuitBreakerState::default()),
            circuit_threshold: 5,
            circuit_reset_timeout: Duration::from_secs(60),
        })
    }

    /// Post the payload; returns `false` when skipped by the open circuit
    pub async fn forward(&self, payload: &ForwardPayload<'_>) -> Result<bool> {
        if self.is_circuit_open().await {
            warn!(url = %self.url, "Circuit breaker open, skipping forward");
            return Ok(false);
        }

        match self.post(payload).await {
            Ok(()) => {
                self.record_success().await;
                debug!(ticket_id = %payload.ticket_id, "Forwarded ingested message");
                Ok(true)
            }
            Err(e) => {
                self.record_failure().await;
                Err(e)
            }
        }
    }

    async fn post(&self, payload: &ForwardPayload<'_>) -> Result<()> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| Error::Internal(format!("Failed to encode forward payload: {}", e)))?;

        let mut request = self
            .http_client
            .post(self.url.clone())
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.secret {
            request = request.header("X-Webhook-Signature", sign(secret, &body)?);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("Forward request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Connection(format!(
                "Forward target returned status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn is_circuit_open(&self) -> bool {
        let state = self.circuit.read().await;
        if !state.is_open {
            return false;
        }
        match state.last_failure {
            Some(last_failure) => {
                let elapsed = Utc::now()
                    .signed_duration_since(last_failure)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                elapsed < self.circuit_reset_timeout
            }
            None => false,
        }
    }

    async fn record_success(&self) {
        let mut state = self.circuit.write().await;
        state.failure_count = 0;
        state.is_open = false;
    }

    async fn record_failure(&self) {
        let mut state = self.circuit.write().await;
        state.failure_count += 1;
        state.last_failure = Some(Utc::now());

        if state.failure_count >= self.circuit_threshold && !state.is_open {
            state.is_open = true;
            warn!(
                url = %self.url,
                failures = state.failure_count,
                "Circuit breaker opened for forward target"
            );
        }
    }
}

/// `sha256=<hex>` HMAC of the body
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("Invalid HMAC key: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn parse_http_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str)
        .map_err(|e| Error::Config(format!("Invalid forward URL: {}", e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(Error::Config(format!(
            "Forward URL scheme '{}' is not allowed. Only http and https are permitted.",
            scheme
        ))),
    }
}

/// Reject URLs targeting loopback, private or link-local hosts
fn validate_webhook_url(url_str: &str) -> Result<Url> {
    let url = parse_http_url(url_str)?;

    let host = url
        .host_str()
        .ok_or_else(|| Error::Config("Forward URL has no host".to_string()))?;

    let lower_host = host.to_lowercase();
    if lower_host == "localhost"
        || lower_host.ends_with(".local")
        || lower_host.ends_with(".internal")
        || lower_host == "169.254.169.254"
    {
        return Err(Error::Config(format!(
            "Forward URL host '{}' is not allowed (internal/private address)",
            host
        )));
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(Error::Config(format!(
                "Forward URL IP '{}' is not allowed (private/internal range)",
                ip
            )));
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                // 100.64.0.0/10
                || ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xC0) == 64
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // fc00::/7
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10
                || (ipv6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
