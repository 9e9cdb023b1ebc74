#![deny(clippy::print_stdout, clippy::print_stderr)]

//! HTTP surface and process wiring for the AR engine: REST endpoints, the
//! raw-body webhook route, per-tenant auth, idempotent POSTs, and the
//! background workers (webhook retry, dunning, GL retry, aging,
//! reconciliation).

use std::sync::Arc;

use remit_billing::Billing;
use remit_billing::BillingWebhookHandler;
use remit_events::InMemoryEventPublisher;
use remit_gl::GlEmitter;
use remit_gl::InMemoryGlPostingQueue;
use remit_idempotency::InMemoryIdempotencyRegistry;
use remit_ledger::InMemoryArStore;
use remit_processor::SandboxProcessor;
use remit_reconcile::InMemoryReconciliationRunStore;
use remit_reconcile::ReconciliationRunner;
use remit_retry::BackoffLadder;
use remit_retry::DEFAULT_JITTER_RATIO;
use remit_retry::WEBHOOK_BACKOFF_MS;
use remit_retry::dunning::DunningSchedule;
use remit_webhooks::InMemoryWebhookStore;
use remit_webhooks::WebhookIngestor;
use remit_webhooks::WebhookRetryEngine;

pub mod config;
pub mod error;
pub mod routes;
pub mod workers;

pub use config::ConfigError;
pub use config::ServerConfig;
pub use routes::build_router;

pub struct AppState {
    pub config: ServerConfig,
    pub billing: Billing,
    pub store: Arc<InMemoryArStore>,
    pub processor: Arc<SandboxProcessor>,
    pub publisher: Arc<InMemoryEventPublisher>,
    pub gl_queue: Arc<InMemoryGlPostingQueue>,
    pub webhook_store: Arc<InMemoryWebhookStore>,
    pub ingestor: WebhookIngestor,
    pub retry_engine: WebhookRetryEngine,
    pub idempotency: Arc<InMemoryIdempotencyRegistry>,
    pub reconciler: ReconciliationRunner,
}

impl AppState {
    /// Wires every component over the in-memory backends. `DATABASE_URL`
    /// is accepted but a relational backend is not linked in this build;
    /// the sandbox processor stands in for the real adapter.
    #[must_use]
    pub fn from_config(config: ServerConfig) -> Arc<Self> {
        if !config.processor_sandbox {
            tracing::warn!(
                "PROCESSOR_SANDBOX=false but no live adapter is linked; using sandbox endpoints"
            );
        }

        let store = Arc::new(InMemoryArStore::new());
        let processor = Arc::new(SandboxProcessor::new());
        let publisher = Arc::new(InMemoryEventPublisher::new());
        let gl_queue = Arc::new(InMemoryGlPostingQueue::new());
        let gl = GlEmitter::new(gl_queue.clone(), publisher.clone());

        let dunning = DunningSchedule::new(
            config.payment_retry_schedule_days.clone(),
            config.max_payment_retry_attempts,
        );
        let billing = Billing::new(store.clone(), processor.clone(), gl, publisher.clone())
            .with_dunning(dunning);

        let ladder = BackoffLadder::new(
            WEBHOOK_BACKOFF_MS
                .iter()
                .map(|ms| std::time::Duration::from_millis(*ms))
                .collect(),
            config.webhook_max_attempts,
            DEFAULT_JITTER_RATIO,
        );
        let webhook_store = Arc::new(InMemoryWebhookStore::new());
        let handler = Arc::new(BillingWebhookHandler::new(billing.clone()));
        let ingestor = WebhookIngestor::new(
            webhook_store.clone(),
            handler.clone(),
            ladder.clone(),
            config.signature_tolerance_seconds,
        );
        let retry_engine = WebhookRetryEngine::new(webhook_store.clone(), handler, ladder);

        let reconciler = ReconciliationRunner::new(
            store.clone(),
            processor.clone(),
            Arc::new(InMemoryReconciliationRunStore::new()),
        );

        Arc::new(Self {
            config,
            billing,
            store,
            processor,
            publisher,
            gl_queue,
            webhook_store,
            ingestor,
            retry_engine,
            idempotency: Arc::new(InMemoryIdempotencyRegistry::new()),
            reconciler,
        })
    }
}
