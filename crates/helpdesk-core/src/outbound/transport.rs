//! SMTP transports per channel

use crate::credentials::{CredentialManager, SmtpSecurity};
use async_trait::async_trait;
use helpdesk_common::{Error, Result};
use helpdesk_storage::models::Channel;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A transport able to deliver built messages
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Health check before reuse
    async fn verify(&self) -> Result<bool>;

    async fn send(&self, message: Message) -> Result<()>;
}

/// Builds a fresh transport for a channel
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(&self, channel: &Channel) -> Result<Arc<dyn MailTransport>>;
}

/// lettre SMTP transport
pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

/// Map an SMTP failure, keeping authentication failures recognizable
fn classify(e: lettre::transport::smtp::Error) -> Error {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("auth") || ["(530)", "(534)", "(535)"].iter().any(|c| message.contains(c)) {
        Error::Auth(format!("SMTP authentication failed: {}", message))
    } else {
        Error::Send(message)
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn verify(&self) -> Result<bool> {
        self.inner.test_connection().await.map_err(classify)
    }

    async fn send(&self, message: Message) -> Result<()> {
        let response = self.inner.send(message).await.map_err(classify)?;
        debug!(code = %response.code(), "SMTP accepted message");
        Ok(())
    }
}

/// Builds SMTP transports from provider parameters and channel credentials
pub struct SmtpTransportFactory {
    credentials: Arc<CredentialManager>,
    timeout: Duration,
}

impl SmtpTransportFactory {
    pub fn new(credentials: Arc<CredentialManager>, timeout: Duration) -> Self {
        Self {
            credentials,
            timeout,
        }
    }
}

#[async_trait]
impl TransportFactory for SmtpTransportFactory {
    async fn build(&self, channel: &Channel) -> Result<Arc<dyn MailTransport>> {
        let kind = channel.provider_kind()?;
        let settings = channel.parsed_settings()?;
        let params = self
            .credentials
            .providers()
            .get(kind)?
            .connection_params(&settings)?;
        let user = settings
            .username
            .clone()
            .unwrap_or_else(|| channel.email_address.clone());

        let builder = match params.smtp_security {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&params.smtp_host)
                .map_err(|e| Error::Config(format!("Invalid SMTP host {}: {}", params.smtp_host, e)))?,
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&params.smtp_host).map_err(
                    |e| Error::Config(format!("Invalid SMTP host {}: {}", params.smtp_host, e)),
                )?
            }
            SmtpSecurity::Plain => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&params.smtp_host)
            }
        }
        .port(params.smtp_port)
        .timeout(Some(self.timeout));

        let builder = if kind.is_oauth() {
            let token = self.credentials.get_valid_access_token(channel.id).await?;
            builder
                .credentials(Credentials::new(user, token))
                .authentication(vec![Mechanism::Xoauth2])
        } else {
            let password = settings.password.clone().ok_or_else(|| {
                Error::Auth(format!("Channel {} has no SMTP password", channel.id))
            })?;
            builder.credentials(Credentials::new(user, password))
        };

        debug!(
            channel_id = %channel.id,
            host = %params.smtp_host,
            port = params.smtp_port,
            "Built SMTP transport"
        );
        Ok(Arc::new(SmtpTransport {
            inner: builder.build(),
        }))
    }
}
