//! Prometheus counters for the ingestion pipeline

use helpdesk_common::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Pipeline counters, registered on an owned registry
#[derive(Clone)]
pub struct IngestionMetrics {
    registry: Registry,
    messages_ingested: IntCounterVec,
    spam_detected: IntCounter,
    attachments_rejected: IntCounterVec,
    outbound_send: IntCounterVec,
    poll_failures: IntCounter,
}

impl IngestionMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_ingested = IntCounterVec::new(
            Opts::new(
                "helpdesk_messages_ingested_total",
                "Inbound messages persisted, by channel and source.",
            ),
            &["channel", "source"],
        )
        .map_err(metrics_error)?;
        let spam_detected = IntCounter::new(
            "helpdesk_spam_detected_total",
            "Inbound messages classified as spam.",
        )
        .map_err(metrics_error)?;
        let attachments_rejected = IntCounterVec::new(
            Opts::new(
                "helpdesk_attachments_rejected_total",
                "Attachments skipped during ingestion, by reason.",
            ),
            &["reason"],
        )
        .map_err(metrics_error)?;
        let outbound_send = IntCounterVec::new(
            Opts::new(
                "helpdesk_outbound_send_total",
                "Outbound send operations, by outcome.",
            ),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let poll_failures = IntCounter::new(
            "helpdesk_channel_poll_failures_total",
            "Failed mailbox poll cycles across all channels.",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(messages_ingested.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(spam_detected.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(attachments_rejected.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(outbound_send.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(poll_failures.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            messages_ingested,
            spam_detected,
            attachments_rejected,
            outbound_send,
            poll_failures,
        })
    }

    pub fn message_ingested(&self, channel: &str, source: &str) {
        self.messages_ingested
            .with_label_values(&[channel, source])
            .inc();
    }

    pub fn spam_detected(&self) {
        self.spam_detected.inc();
    }

    pub fn attachment_rejected(&self, reason: &str) {
        self.attachments_rejected.with_label_values(&[reason]).inc();
    }

    pub fn outbound_sent(&self, outcome: &str) {
        self.outbound_send.with_label_values(&[outcome]).inc();
    }

    pub fn poll_failed(&self) {
        self.poll_failures.inc();
    }

    /// Text exposition format for `/metrics`
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics error: {}", e))
}
