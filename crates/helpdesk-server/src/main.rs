//! Helpdesk - email ingestion and delivery entry point

use anyhow::Result;
use helpdesk_api::AppState;
use helpdesk_common::config::{Config, LoggingConfig};
use helpdesk_core::{
    AttachmentHandler, ConnectionRegistry, CredentialManager, ImapOpener, IngestionMetrics,
    IngestionOrchestrator, MailboxConnector, OutboundMailer, OutboundService, PipelineConfig,
    ProviderRegistry, SmtpTransportFactory, TicketForwarder,
};
use helpdesk_storage::{DatabasePool, LocalStorage, Repositories};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting helpdesk email pipeline...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;

    // Run migrations
    db_pool.migrate().await?;
    info!("Database migrations completed");

    let repos = Repositories::postgres(db_pool.clone());

    // Initialize file storage
    let file_storage = Arc::new(LocalStorage::new(&config.storage)?);

    let metrics = Arc::new(IngestionMetrics::new()?);

    // Credentials and mailbox access
    let providers = ProviderRegistry::from_config(&config.oauth)?;
    let mut credentials = CredentialManager::new(repos.channels.clone(), providers);
    match &config.oauth.state_secret {
        Some(secret) => credentials = credentials.with_state_secret(secret),
        None => warn!("oauth.state_secret not set; OAuth consent links are only valid on this instance"),
    }
    let credentials = Arc::new(credentials);
    let connector = Arc::new(MailboxConnector::new(
        credentials.clone(),
        Arc::new(ImapOpener),
        Arc::new(ConnectionRegistry::new()),
    ));

    let attachments = Arc::new(
        AttachmentHandler::new(
            file_storage.clone(),
            repos.attachments.clone(),
            repos.messages.clone(),
            &config.attachments,
        )
        .with_metrics(metrics.clone()),
    );

    // Ingestion orchestrator
    let mut orchestrator = IngestionOrchestrator::new(
        repos.clone(),
        connector,
        attachments.clone(),
        metrics.clone(),
        PipelineConfig::from(&config),
    );
    if let Some(url) = &config.ingestion.forward_url {
        let forwarder = TicketForwarder::new(
            url,
            config.ingestion.forward_secret.clone(),
            config.ingestion.forward_allow_private,
        )?;
        info!(%url, "Forwarding ingested messages");
        orchestrator = orchestrator.with_forwarder(Arc::new(forwarder));
    }
    let orchestrator = Arc::new(orchestrator);

    // Outbound delivery
    let mailer = Arc::new(
        OutboundMailer::new(
            Arc::new(SmtpTransportFactory::new(
                credentials.clone(),
                Duration::from_secs(config.outbound.timeout_secs),
            )),
            &config.outbound,
        )
        .with_metrics(metrics.clone()),
    );
    let outbound = Arc::new(OutboundService::new(
        repos.clone(),
        mailer,
        orchestrator.threads().clone(),
    ));

    // Bring channels online
    orchestrator.start().await?;

    // Start API server
    let api_handle = {
        let state = Arc::new(AppState {
            repos,
            orchestrator: orchestrator.clone(),
            outbound,
            credentials,
            attachments,
            files: file_storage,
            metrics,
            api_token_hash: config.api.token_hash.clone(),
            cors_origins: config.api.cors_origins.clone(),
            max_body_bytes: config.attachments.request_body_limit(),
        });
        let app = helpdesk_api::create_router(state);
        let addr = format!("{}:{}", config.server.bind_address, config.api.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Starting API server on {}", addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("API server error: {}", e);
            }
        })
    };

    info!("Helpdesk started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Cleanup
    api_handle.abort();
    orchestrator.shutdown().await;

    info!("Helpdesk shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},helpdesk=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
