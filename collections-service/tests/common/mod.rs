#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use collections_service::config::{
    CollectionsConfig, DatabaseConfig, InvoiceConfig, RedisConfig, SchedulerConfig, SmtpConfig,
    StripeConfig,
};
use collections_service::models::{Invoice, Rate, StaffLineItem, StaffingRequest};
use collections_service::services::{
    MockDueQueue, MockEmailSender, MockPaymentProvider, MockRepository,
};
use collections_service::startup::{AppState, Application, Collaborators, StateSettings};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::utils::{generate_webhook_signature, SignatureHeader};
use std::sync::{Arc, Once};
use tokio::sync::oneshot;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const CLIENT_EMAIL: &str = "client@example.com";
pub const SUPPORT_EMAIL: &str = "support@example.com";

static TRACING: Once = Once::new();

pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("collections_service=debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn test_config() -> CollectionsConfig {
    CollectionsConfig {
        common: service_core::config::Config {
            port: 0,
            environment: "test".to_string(),
        },
        service_name: "collections-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: Secret::new("postgres://localhost:5432/collections_test".to_string()),
            max_connections: 2,
            min_connections: 1,
        },
        redis: RedisConfig {
            url: Secret::new("redis://localhost:6379".to_string()),
        },
        stripe: StripeConfig {
            api_key: Secret::new("sk_test_key".to_string()),
            webhook_secret: Secret::new(WEBHOOK_SECRET.to_string()),
            api_base_url: "https://api.stripe.test".to_string(),
            success_url: "https://app.test/paid".to_string(),
            webhook_tolerance_seconds: 300,
            timeout_seconds: 5,
        },
        smtp: SmtpConfig {
            host: "localhost".to_string(),
            port: 1025,
            user: String::new(),
            password: Secret::new(String::new()),
            from_email: "billing@example.com".to_string(),
            from_name: "Billing".to_string(),
            enabled: false,
            support_reply_to: SUPPORT_EMAIL.to_string(),
        },
        scheduler: SchedulerConfig {
            enabled: false,
            tick_seconds: 60,
            default_delay_days: 1,
            renotify_interval_days: 5,
        },
        invoice: InvoiceConfig {
            terms_and_conditions: Some("Net on receipt.".to_string()),
        },
    }
}

/// Fixed clock used by the service-level tests.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap()
}

/// Services wired to in-memory collaborators.
pub struct TestHarness {
    pub repo: Arc<MockRepository>,
    pub queue: Arc<MockDueQueue>,
    pub email: Arc<MockEmailSender>,
    pub payments: Arc<MockPaymentProvider>,
    pub state: AppState,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(&test_config())
    }

    pub fn with_config(config: &CollectionsConfig) -> Self {
        init_test_tracing();

        let repo = Arc::new(MockRepository::new());
        let queue = Arc::new(MockDueQueue::new());
        let email = Arc::new(MockEmailSender::new());
        let payments = Arc::new(MockPaymentProvider::new());

        let state = AppState::new(
            Collaborators {
                invoices: repo.clone(),
                requests: repo.clone(),
                queue: queue.clone(),
                email: email.clone(),
                payments: payments.clone(),
            },
            StateSettings::from(config),
        );

        Self {
            repo,
            queue,
            email,
            payments,
            state,
        }
    }

    /// A request starting at `start_date` with two bartenders for five hours at $40
    /// (subtotal $400). Returns the request id.
    pub fn seed_request(&self, start_date: DateTime<Utc>) -> Uuid {
        let request_id = Uuid::new_v4();
        let branch_id = Uuid::new_v4();

        self.repo.add_request(StaffingRequest {
            request_id,
            branch_id,
            first_name: "Grace".to_string(),
            last_name: "Hopper".to_string(),
            email: CLIENT_EMAIL.to_string(),
            event_location: Some("Harbor Pavilion".to_string()),
            start_date,
            created_utc: start_date - Duration::days(30),
        });
        self.repo.add_rate(Rate {
            rate_id: Uuid::new_v4(),
            staff_type: "bartender".to_string(),
            branch_id,
            hourly_rate: Decimal::new(40, 0),
        });
        self.repo.add_staff_line_item(StaffLineItem {
            line_item_id: Uuid::new_v4(),
            request_id,
            position: "bartender".to_string(),
            count: 2,
            hourly_rate: Decimal::new(40, 0),
            start_time: start_date,
            end_time: start_date + Duration::hours(5),
            shift_date: start_date.date_naive(),
        });

        request_id
    }

    /// Seeded request plus its invoice.
    pub async fn seed_invoice(&self, start_date: DateTime<Utc>) -> Invoice {
        let request_id = self.seed_request(start_date);
        self.state
            .ledger
            .create_invoice(request_id)
            .await
            .expect("Failed to create invoice")
    }
}

/// Build a signature header for `payload` signed at `timestamp`.
pub fn sign(payload: &str, timestamp: i64) -> String {
    let signature = generate_webhook_signature(WEBHOOK_SECRET, timestamp, payload)
        .expect("Failed to sign payload");
    SignatureHeader::format(timestamp, &signature)
}

pub fn checkout_completed_event(
    event_id: &str,
    invoice_id: Uuid,
    amount_cents: i64,
    payment_intent: &str,
) -> String {
    serde_json::json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": "cs_test_123",
                "payment_status": "paid",
                "amount_total": amount_cents,
                "payment_intent": payment_intent,
                "metadata": { "invoice_id": invoice_id.to_string() }
            }
        }
    })
    .to_string()
}

pub fn charge_refunded_event(event_id: &str, payment_intent: &str) -> String {
    serde_json::json!({
        "id": event_id,
        "type": "charge.refunded",
        "data": {
            "object": {
                "id": "ch_test_123",
                "payment_intent": payment_intent
            }
        }
    })
    .to_string()
}

/// Running HTTP server backed by a [`TestHarness`].
pub struct TestApp {
    pub address: String,
    pub http_port: u16,
    pub harness: TestHarness,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let config = test_config();
        let harness = TestHarness::with_config(&config);

        let app = Application::build_with(config, harness.state.clone())
            .await
            .expect("Failed to build test application");
        let http_port = app.http_port();
        let address = format!("http://127.0.0.1:{}", http_port);

        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(app.run_until_stopped(async move {
            let _ = rx.await;
        }));

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            http_port,
            harness,
            shutdown: Some(tx),
            server: Some(server),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Trigger graceful shutdown and wait for the server task to finish.
    pub async fn stop(mut self) -> std::io::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.server.take() {
            Some(server) => server.await.expect("Server task panicked"),
            None => Ok(()),
        }
    }
}
