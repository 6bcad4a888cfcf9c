//! Payment reconciler: applies verified payment provider webhooks to the ledger.

use crate::services::ledger::InvoiceLedger;
use crate::services::metrics::WEBHOOK_EVENTS_TOTAL;
use crate::services::repository::{MutationOutcome, ProcessedEvent};
use crate::services::stripe::{from_cents, ChargeObject, CheckoutSessionObject, WebhookEvent};
use chrono::Utc;
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use service_core::error::AppError;
use service_core::utils::verify_webhook_signature;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CHARGE_REFUNDED: &str = "charge.refunded";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied { invoice_id: Uuid },
    Duplicate { event_id: String },
    Ignored { reason: String },
}

impl WebhookOutcome {
    fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied { .. } => "applied",
            WebhookOutcome::Duplicate { .. } => "duplicate",
            WebhookOutcome::Ignored { .. } => "ignored",
        }
    }

    fn ignored(reason: impl Into<String>) -> Self {
        WebhookOutcome::Ignored {
            reason: reason.into(),
        }
    }
}

#[derive(Clone)]
pub struct PaymentReconciler {
    ledger: InvoiceLedger,
    webhook_secret: Secret<String>,
    tolerance_seconds: i64,
}

impl PaymentReconciler {
    pub fn new(ledger: InvoiceLedger, webhook_secret: Secret<String>, tolerance_seconds: i64) -> Self {
        Self {
            ledger,
            webhook_secret,
            tolerance_seconds,
        }
    }

    /// Verify and apply a raw webhook delivery.
    pub async fn handle(
        &self,
        payload: &str,
        signature_header: Option<&str>,
    ) -> Result<WebhookOutcome, AppError> {
        self.handle_at(payload, signature_header, Utc::now().timestamp())
            .await
    }

    #[instrument(skip(self, payload, signature_header))]
    pub async fn handle_at(
        &self,
        payload: &str,
        signature_header: Option<&str>,
        now_unix: i64,
    ) -> Result<WebhookOutcome, AppError> {
        if let Err(e) = self.verify(payload, signature_header, now_unix) {
            WEBHOOK_EVENTS_TOTAL
                .with_label_values(&["unknown", "rejected"])
                .inc();
            return Err(e);
        }

        let event: WebhookEvent = serde_json::from_str(payload)?;

        let outcome = match event.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => self.on_checkout_completed(&event).await?,
            CHARGE_REFUNDED => self.on_charge_refunded(&event).await?,
            other => {
                debug!(event_type = %other, event_id = %event.id, "Unhandled webhook event type");
                WebhookOutcome::ignored(format!("unhandled event type {}", other))
            }
        };

        WEBHOOK_EVENTS_TOTAL
            .with_label_values(&[event.event_type.as_str(), outcome.label()])
            .inc();

        Ok(outcome)
    }

    fn verify(
        &self,
        payload: &str,
        signature_header: Option<&str>,
        now_unix: i64,
    ) -> Result<(), AppError> {
        let secret = self.webhook_secret.expose_secret();
        if secret.is_empty() {
            warn!("Webhook secret not configured; rejecting delivery");
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Webhook secret not configured"
            )));
        }

        let header = signature_header.ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing Stripe-Signature header"))
        })?;

        verify_webhook_signature(secret, header, payload, now_unix, self.tolerance_seconds)
            .map(|_| ())
            .map_err(|e| {
                warn!(error = %e, "Webhook signature verification failed");
                AppError::Unauthorized(anyhow::anyhow!("Invalid webhook signature: {}", e))
            })
    }

    async fn on_checkout_completed(
        &self,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, AppError> {
        let session: CheckoutSessionObject = match serde_json::from_value(event.data.object.clone())
        {
            Ok(session) => session,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Malformed checkout session object");
                return Ok(WebhookOutcome::ignored("malformed checkout session"));
            }
        };

        let Some(invoice_id) = session
            .metadata
            .get("invoice_id")
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            warn!(event_id = %event.id, "Checkout session without a valid invoice_id");
            return Ok(WebhookOutcome::ignored("missing invoice_id metadata"));
        };

        if session.payment_status.as_deref() != Some("paid") {
            info!(
                event_id = %event.id,
                invoice_id = %invoice_id,
                payment_status = ?session.payment_status,
                "Checkout completed without payment"
            );
            return Ok(WebhookOutcome::ignored("session not paid"));
        }

        let processed = ProcessedEvent {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
        };
        let settled_amount = session.amount_total.map(from_cents);

        let outcome = self
            .ledger
            .apply_payment(invoice_id, settled_amount, session.payment_intent, &processed)
            .await?;

        Ok(match outcome {
            MutationOutcome::Applied(_) => WebhookOutcome::Applied { invoice_id },
            MutationOutcome::Duplicate => WebhookOutcome::Duplicate {
                event_id: event.id.clone(),
            },
            MutationOutcome::NotFound => {
                warn!(event_id = %event.id, invoice_id = %invoice_id, "Payment for unknown invoice");
                WebhookOutcome::ignored("unknown invoice")
            }
        })
    }

    async fn on_charge_refunded(&self, event: &WebhookEvent) -> Result<WebhookOutcome, AppError> {
        let charge: ChargeObject = match serde_json::from_value(event.data.object.clone()) {
            Ok(charge) => charge,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Malformed charge object");
                return Ok(WebhookOutcome::ignored("malformed charge"));
            }
        };

        let Some(payment_intent) = charge.payment_intent else {
            warn!(event_id = %event.id, "Refunded charge without payment intent");
            return Ok(WebhookOutcome::ignored("missing payment_intent"));
        };

        let processed = ProcessedEvent {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
        };

        Ok(
            match self.ledger.mark_refunded(&payment_intent, &processed).await? {
                Some(MutationOutcome::Applied(invoice)) => WebhookOutcome::Applied {
                    invoice_id: invoice.invoice_id,
                },
                Some(MutationOutcome::Duplicate) => WebhookOutcome::Duplicate {
                    event_id: event.id.clone(),
                },
                Some(MutationOutcome::NotFound) | None => {
                    WebhookOutcome::ignored("no invoice for payment intent")
                }
            },
        )
    }
}
