//! Helpdesk Core - mail ingestion, threading and delivery
//!
//! This crate holds the services behind the helpdesk's email channels:
//! credential handling, mailbox access, spam scoring, thread reconstruction,
//! attachment storage, outbound delivery and the ingestion orchestrator.

pub mod attachments;
pub mod credentials;
pub mod ingestion;
pub mod mailbox;
pub mod metrics;
pub mod outbound;
pub mod spam;
pub mod threading;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use attachments::AttachmentHandler;
pub use credentials::{AuthorizationState, CredentialManager, ProviderRegistry};
pub use ingestion::{
    IngestOutcome, IngestedMessage, IngestionOrchestrator, PipelineConfig, TicketForwarder,
};
pub use mailbox::{ConnectionRegistry, ImapOpener, MailboxConnector};
pub use metrics::IngestionMetrics;
pub use outbound::{OutboundMailer, OutboundRequest, OutboundService, SendResult, SmtpTransportFactory};
pub use spam::{SpamDetector, SpamVerdict};
pub use threading::ThreadReconstructor;
