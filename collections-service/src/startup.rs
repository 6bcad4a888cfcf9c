//! Application startup and lifecycle management.

use crate::config::{CollectionsConfig, SchedulerConfig};
use crate::handlers::{follow_ups, health, invoices, rates, webhooks};
use crate::services::{
    Database, DueQueue, EmailSender, FollowUpScheduler, InvoiceLedger,
    InvoiceRepository, PaymentProvider, PaymentReconciler, PricingEngine, RedisDueQueue,
    RequestRepository, SmtpEmailSender, StripeClient,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Storage and outbound integrations the services are built from.
pub struct Collaborators {
    pub invoices: Arc<dyn InvoiceRepository>,
    pub requests: Arc<dyn RequestRepository>,
    pub queue: Arc<dyn DueQueue>,
    pub email: Arc<dyn EmailSender>,
    pub payments: Arc<dyn PaymentProvider>,
}

/// Settings the services need from configuration.
#[derive(Debug, Clone)]
pub struct StateSettings {
    pub webhook_secret: Secret<String>,
    pub webhook_tolerance_seconds: i64,
    pub scheduler: SchedulerConfig,
    pub support_reply_to: String,
    pub terms_and_conditions: Option<String>,
}

impl From<&CollectionsConfig> for StateSettings {
    fn from(config: &CollectionsConfig) -> Self {
        Self {
            webhook_secret: config.stripe.webhook_secret.clone(),
            webhook_tolerance_seconds: config.stripe.webhook_tolerance_seconds,
            scheduler: config.scheduler.clone(),
            support_reply_to: config.smtp.support_reply_to.clone(),
            terms_and_conditions: config.invoice.terms_and_conditions.clone(),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pricing: PricingEngine,
    pub ledger: InvoiceLedger,
    pub reconciler: PaymentReconciler,
    pub scheduler: Arc<FollowUpScheduler>,
    pub payments: Arc<dyn PaymentProvider>,
}

impl AppState {
    pub fn new(collaborators: Collaborators, settings: StateSettings) -> Self {
        let pricing = PricingEngine::new(collaborators.requests.clone());
        let ledger = InvoiceLedger::new(
            collaborators.invoices,
            collaborators.requests,
            pricing.clone(),
            settings.terms_and_conditions,
        );
        let reconciler = PaymentReconciler::new(
            ledger.clone(),
            settings.webhook_secret,
            settings.webhook_tolerance_seconds,
        );
        let scheduler = Arc::new(FollowUpScheduler::new(
            ledger.clone(),
            collaborators.queue,
            collaborators.email,
            collaborators.payments.clone(),
            &settings.scheduler,
            settings.support_reply_to,
        ));

        Self {
            pricing,
            ledger,
            reconciler,
            scheduler,
            payments: collaborators.payments,
        }
    }
}

/// HTTP routes with tracing and request-id layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route(
            "/requests/:request_id/invoice",
            post(invoices::create_invoice).get(invoices::get_invoice_by_request),
        )
        .route(
            "/requests/:request_id/rates",
            get(rates::get_rates).put(rates::update_rates),
        )
        .route(
            "/requests/:request_id/scheduled-emails",
            post(follow_ups::schedule_email),
        )
        .route(
            "/invoices/:id",
            get(invoices::get_invoice)
                .patch(invoices::update_invoice)
                .delete(invoices::delete_invoice),
        )
        .route(
            "/invoices/:id/recalculate",
            post(invoices::recalculate_invoice),
        )
        .route("/invoices/:id/checkout", post(invoices::create_checkout))
        .route("/invoices/:id/refund", post(invoices::refund_invoice))
        .route(
            "/invoices/:id/follow-up",
            post(follow_ups::send_custom_follow_up),
        )
        .route("/invoices/:id/email", post(follow_ups::send_invoice_email))
        .route(
            "/admin/follow-ups/trigger",
            post(follow_ups::trigger_follow_ups),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    scheduler_enabled: bool,
    state: AppState,
}

impl Application {
    /// Connect every collaborator, run migrations and bind the listener.
    pub async fn build(config: CollectionsConfig) -> Result<Self, AppError> {
        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let db = Arc::new(db);

        let queue = RedisDueQueue::new(&config.redis).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to Redis");
            AppError::InternalError(e)
        })?;

        let email = SmtpEmailSender::new(config.smtp.clone()).map_err(|e| {
            tracing::error!(error = %e, "Failed to create SMTP transport");
            AppError::ConfigError(anyhow::anyhow!("SMTP setup failed: {}", e))
        })?;
        if !email.is_enabled() {
            tracing::warn!("SMTP disabled - follow-up and invoice emails will fail");
        }

        let payments = StripeClient::new(config.stripe.clone()).map_err(|e| {
            tracing::error!(error = %e, "Failed to create Stripe client");
            AppError::ConfigError(anyhow::anyhow!("Stripe client setup failed: {}", e))
        })?;
        if !payments.is_configured() {
            tracing::warn!("Stripe API key not set - payment links are disabled");
        }

        let collaborators = Collaborators {
            invoices: db.clone(),
            requests: db,
            queue: Arc::new(queue),
            email: Arc::new(email),
            payments: Arc::new(payments),
        };
        let state = AppState::new(collaborators, StateSettings::from(&config));

        Self::build_with(config, state).await
    }

    /// Bind the listener for prebuilt state.
    pub async fn build_with(config: CollectionsConfig, state: AppState) -> Result<Self, AppError> {
        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Collections service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            scheduler_enabled: config.scheduler.enabled,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Serve until `shutdown` resolves, then drain HTTP and stop the scheduler.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scheduler = if self.scheduler_enabled {
            Some(self.state.scheduler.clone().start())
        } else {
            tracing::info!("Follow-up scheduler disabled by configuration");
            None
        };

        let app = router(self.state);

        tracing::info!(
            service = "collections-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some(handle) = scheduler {
            handle.stop().await;
        }

        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }

        Ok(())
    }
}
