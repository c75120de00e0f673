//! Error types for the helpdesk pipeline

use thiserror::Error;

/// Main error type for the helpdesk pipeline
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mailbox unreachable or login rejected
    #[error("Connection error: {0}")]
    Connection(String),

    /// No usable credentials; the channel needs re-authorization
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Token endpoint rejected a refresh or code exchange
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Outbound delivery failed after all retries
    #[error("Send error: {0}")]
    Send(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for the helpdesk pipeline
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Connection(_) => 502,
            Error::Auth(_) => 401,
            Error::Provider(_) => 502,
            Error::Validation(_) => 422,
            Error::Send(_) => 502,
            Error::Persistence(_) => 500,
            Error::Storage(_) => 500,
            Error::NotFound(_) => 404,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Connection(_) => "CONNECTION_ERROR",
            Error::Auth(_) => "AUTH_ERROR",
            Error::Provider(_) => "PROVIDER_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Send(_) => "SEND_ERROR",
            Error::Persistence(_) => "PERSISTENCE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error denotes an authentication failure.
    ///
    /// Transport libraries report auth failures as free text, so this
    /// matches on the message as well as on the variant.
    pub fn is_auth_class(&self) -> bool {
        matches!(self, Error::Auth(_)) || self.to_string().to_lowercase().contains("auth")
    }
}
