//! Router wired to in-memory repositories and fake mail backends

use axum_test::TestServer;
use helpdesk_common::config::{
    OAuthConfig, OutboundConfig, StorageConfig, WebhookConfig,
};
use helpdesk_core::mailbox::ConnectionRegistry;
use helpdesk_core::testing::{FakeMailbox, FakeOpener, FakeTransport, FakeTransportFactory, MemoryStore};
use helpdesk_core::{
    AttachmentHandler, CredentialManager, IngestionMetrics, IngestionOrchestrator,
    MailboxConnector, OutboundMailer, OutboundService, PipelineConfig, ProviderRegistry,
};
use helpdesk_storage::LocalStorage;
use std::sync::Arc;
use tempfile::TempDir;

use crate::auth::AppState;
use crate::create_router;

#[derive(Default)]
pub struct Options {
    pub token_hash: Option<String>,
    pub webhook: WebhookConfig,
    pub oauth: OAuthConfig,
}

pub struct TestApp {
    pub server: TestServer,
    pub store: MemoryStore,
    pub mailbox: Arc<FakeMailbox>,
    pub transport: Arc<FakeTransport>,
    pub factory: Arc<FakeTransportFactory>,
    pub credentials: Arc<CredentialManager>,
    pub files: Arc<LocalStorage>,
    _dir: TempDir,
}

pub fn app() -> TestApp {
    app_with(Options::default())
}

pub fn app_with(options: Options) -> TestApp {
    let store = MemoryStore::new();
    let repos = store.repositories();

    let providers = ProviderRegistry::from_config(&options.oauth).unwrap();
    let credentials = Arc::new(CredentialManager::new(repos.channels.clone(), providers));

    let mailbox = Arc::new(FakeMailbox::new());
    let connector = Arc::new(MailboxConnector::new(
        credentials.clone(),
        Arc::new(FakeOpener::new(mailbox.clone())),
        Arc::new(ConnectionRegistry::new()),
    ));

    let dir = TempDir::new().unwrap();
    let files = Arc::new(
        LocalStorage::new(&StorageConfig {
            backend: "fs".to_string(),
            path: dir.path().to_path_buf(),
            public_base_url: "http://localhost/files".to_string(),
            signing_secret: "file-secret".to_string(),
        })
        .unwrap(),
    );
    let metrics = Arc::new(IngestionMetrics::new().unwrap());

    let max_body_bytes = PipelineConfig::default().attachments.request_body_limit();
    let pipeline = PipelineConfig {
        webhook: options.webhook,
        ..PipelineConfig::default()
    };
    let attachments = Arc::new(
        AttachmentHandler::new(
            files.clone(),
            repos.attachments.clone(),
            repos.messages.clone(),
            &pipeline.attachments,
        )
        .with_metrics(metrics.clone()),
    );
    let orchestrator = Arc::new(IngestionOrchestrator::new(
        repos.clone(),
        connector,
        attachments.clone(),
        metrics.clone(),
        pipeline,
    ));

    let transport = Arc::new(FakeTransport::new());
    let factory = Arc::new(FakeTransportFactory::new(transport.clone()));
    let mailer = Arc::new(
        OutboundMailer::new(
            factory.clone(),
            &OutboundConfig::default(),
        )
        .with_metrics(metrics.clone()),
    );
    let outbound = Arc::new(OutboundService::new(
        repos.clone(),
        mailer,
        orchestrator.threads().clone(),
    ));

    let state = Arc::new(AppState {
        repos,
        orchestrator,
        outbound,
        credentials: credentials.clone(),
        attachments,
        files: files.clone(),
        metrics,
        api_token_hash: options.token_hash,
        cors_origins: vec!["https://agent.acme.test".to_string()],
        max_body_bytes,
    });

    TestApp {
        server: TestServer::new(create_router(state)).unwrap(),
        store,
        mailbox,
        transport,
        factory,
        credentials,
        files,
        _dir: dir,
    }
}
