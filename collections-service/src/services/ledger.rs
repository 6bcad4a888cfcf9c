//! Invoice ledger: lifecycle and balances of request invoices.
//!
//! Every mutation goes through `InvoiceRepository::modify_invoice`, so a change is
//! one locked read-modify-write and never a separate read followed by a save.

use crate::models::{CustomLineItemInput, Invoice, InvoiceStatus, StaffingRequest, UpdateInvoice};
use crate::services::metrics::{INVOICES_TOTAL, PAYMENT_AMOUNT_TOTAL};
use crate::services::pricing::PricingEngine;
use crate::services::repository::{
    InvoiceMutation, InvoiceRepository, MutationOutcome, ProcessedEvent, RequestRepository,
};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Clone)]
pub struct InvoiceLedger {
    invoices: Arc<dyn InvoiceRepository>,
    requests: Arc<dyn RequestRepository>,
    pricing: PricingEngine,
    terms_and_conditions: Option<String>,
}

fn invoice_not_found(invoice_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id))
}

impl InvoiceLedger {
    pub fn new(
        invoices: Arc<dyn InvoiceRepository>,
        requests: Arc<dyn RequestRepository>,
        pricing: PricingEngine,
        terms_and_conditions: Option<String>,
    ) -> Self {
        Self {
            invoices,
            requests,
            pricing,
            terms_and_conditions,
        }
    }

    /// Price a request and open its invoice.
    #[instrument(skip(self))]
    pub async fn create_invoice(&self, request_id: Uuid) -> Result<Invoice, AppError> {
        let request = self.request_for(request_id).await?;
        let breakdown = self.pricing.calculate_rates(request_id).await?;

        let invoice = Invoice::for_request(
            &request,
            &breakdown,
            self.terms_and_conditions.clone(),
            Utc::now(),
        );
        let invoice = self.invoices.insert_invoice(&invoice).await?;

        INVOICES_TOTAL.with_label_values(&["pending"]).inc();
        info!(
            invoice_id = %invoice.invoice_id,
            request_id = %request_id,
            amount = %invoice.amount,
            "Invoice created"
        );

        Ok(invoice)
    }

    #[instrument(skip(self))]
    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<Invoice, AppError> {
        self.invoices
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| invoice_not_found(invoice_id))
    }

    #[instrument(skip(self))]
    pub async fn get_invoice_by_request(&self, request_id: Uuid) -> Result<Invoice, AppError> {
        self.invoices
            .get_invoice_by_request(request_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("No invoice for request {}", request_id))
            })
    }

    #[instrument(skip(self))]
    pub async fn request_for(&self, request_id: Uuid) -> Result<StaffingRequest, AppError> {
        self.requests
            .get_request(request_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Request {} not found", request_id)))
    }

    #[instrument(skip(self, patch))]
    pub async fn update_invoice(
        &self,
        invoice_id: Uuid,
        patch: UpdateInvoice,
    ) -> Result<Invoice, AppError> {
        patch.validate()?;

        let status = patch.status;
        let invoice = self
            .mutate(
                invoice_id,
                Box::new(move |invoice: &mut Invoice| invoice.apply_update(&patch)),
            )
            .await?;

        if let Some(status) = status {
            INVOICES_TOTAL.with_label_values(&[status.as_str()]).inc();
        }
        info!(invoice_id = %invoice_id, "Invoice updated");

        Ok(invoice)
    }

    /// Save custom line items for the invoice's request and re-price the invoice.
    #[instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn recalculate_with_items(
        &self,
        invoice_id: Uuid,
        items: Vec<CustomLineItemInput>,
    ) -> Result<Invoice, AppError> {
        let current = self.get_invoice(invoice_id).await?;
        let sheet = self.pricing.update_rates(current.request_id, items).await?;
        let breakdown = sheet.breakdown;

        let invoice = self
            .mutate(
                invoice_id,
                Box::new(move |invoice: &mut Invoice| {
                    invoice.apply_breakdown(&breakdown);
                    invoice.settle();
                    Ok(())
                }),
            )
            .await?;

        INVOICES_TOTAL
            .with_label_values(&[invoice.status().as_str()])
            .inc();
        info!(
            invoice_id = %invoice_id,
            amount = %invoice.amount,
            balance = %invoice.balance,
            status = %invoice.status,
            "Invoice recalculated"
        );

        Ok(invoice)
    }

    /// Record a settled payment exactly once per provider event.
    ///
    /// Without an explicit amount the outstanding balance is settled in full.
    #[instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn apply_payment(
        &self,
        invoice_id: Uuid,
        settled_amount: Option<Decimal>,
        payment_intent: Option<String>,
        event: &ProcessedEvent,
    ) -> Result<MutationOutcome, AppError> {
        let outcome = self
            .invoices
            .modify_invoice(
                invoice_id,
                Some(event),
                Box::new(move |invoice: &mut Invoice| {
                    let amount = settled_amount.unwrap_or(invoice.balance);
                    invoice.apply_payment(amount, payment_intent);
                    Ok(())
                }),
            )
            .await?;

        if let MutationOutcome::Applied(invoice) = &outcome {
            INVOICES_TOTAL
                .with_label_values(&[invoice.status().as_str()])
                .inc();
            if let Some(amount) = settled_amount.and_then(|a| a.to_f64()) {
                PAYMENT_AMOUNT_TOTAL.inc_by(amount);
            }
            info!(
                invoice_id = %invoice_id,
                amount_paid = %invoice.amount_paid,
                balance = %invoice.balance,
                status = %invoice.status,
                "Payment applied"
            );
        }

        Ok(outcome)
    }

    /// Mark the invoice holding `payment_intent` as refunded. Returns `None` when no
    /// invoice tracks the payment intent.
    #[instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn mark_refunded(
        &self,
        payment_intent: &str,
        event: &ProcessedEvent,
    ) -> Result<Option<MutationOutcome>, AppError> {
        let Some(invoice_id) = self
            .invoices
            .find_invoice_id_by_payment_intent(payment_intent)
            .await?
        else {
            warn!(payment_intent = %payment_intent, "No invoice tracks refunded payment");
            return Ok(None);
        };

        let outcome = self
            .invoices
            .modify_invoice(
                invoice_id,
                Some(event),
                Box::new(|invoice: &mut Invoice| {
                    invoice.set_status(InvoiceStatus::Refunded);
                    Ok(())
                }),
            )
            .await?;

        if matches!(outcome, MutationOutcome::Applied(_)) {
            INVOICES_TOTAL.with_label_values(&["refunded"]).inc();
            info!(invoice_id = %invoice_id, "Invoice refunded");
        }

        Ok(Some(outcome))
    }

    #[instrument(skip(self))]
    pub async fn overdue_invoices(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, AppError> {
        self.invoices.list_overdue_invoices(now).await
    }

    #[instrument(skip(self))]
    pub async fn record_follow_up(
        &self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Invoice, AppError> {
        self.mutate(
            invoice_id,
            Box::new(move |invoice: &mut Invoice| {
                invoice.record_follow_up(now);
                Ok(())
            }),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_invoice(&self, invoice_id: Uuid) -> Result<(), AppError> {
        if self.invoices.delete_invoice(invoice_id).await? {
            Ok(())
        } else {
            Err(invoice_not_found(invoice_id))
        }
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.invoices.health_check().await
    }

    async fn mutate(
        &self,
        invoice_id: Uuid,
        mutation: InvoiceMutation,
    ) -> Result<Invoice, AppError> {
        match self
            .invoices
            .modify_invoice(invoice_id, None, mutation)
            .await?
        {
            MutationOutcome::Applied(invoice) => Ok(invoice),
            MutationOutcome::NotFound => Err(invoice_not_found(invoice_id)),
            MutationOutcome::Duplicate => Err(AppError::InternalError(anyhow::anyhow!(
                "Unkeyed invoice mutation reported as duplicate"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StaffLineItem;
    use crate::services::repository::MockRepository;
    use chrono::Duration;

    fn event(id: &str) -> ProcessedEvent {
        ProcessedEvent {
            event_id: id.to_string(),
            event_type: "checkout.session.completed".to_string(),
        }
    }

    fn ledger_with_request() -> (InvoiceLedger, Arc<MockRepository>, Uuid) {
        let repo = Arc::new(MockRepository::new());
        let request_id = Uuid::new_v4();
        let now = Utc::now();
        repo.add_request(StaffingRequest {
            request_id,
            branch_id: Uuid::new_v4(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            event_location: Some("Pier 39".to_string()),
            start_date: now + Duration::days(14),
            created_utc: now,
        });
        repo.add_staff_line_item(StaffLineItem {
            line_item_id: Uuid::new_v4(),
            request_id,
            position: "bartender".to_string(),
            count: 4,
            hourly_rate: Decimal::new(20, 0),
            start_time: now,
            end_time: now + Duration::hours(5),
            shift_date: now.date_naive(),
        });

        let pricing = PricingEngine::new(repo.clone());
        let ledger = InvoiceLedger::new(
            repo.clone(),
            repo.clone(),
            pricing,
            Some("Net 30".to_string()),
        );
        (ledger, repo, request_id)
    }

    #[tokio::test]
    async fn test_create_invoice_defaults() {
        let (ledger, _, request_id) = ledger_with_request();

        let invoice = ledger.create_invoice(request_id).await.unwrap();

        assert_eq!(invoice.status(), InvoiceStatus::Pending);
        assert_eq!(invoice.subtotal, Decimal::new(400, 0));
        assert_eq!(invoice.balance, invoice.amount);
        assert_eq!(invoice.ship_to.as_deref(), Some("Pier 39"));
        assert_eq!(invoice.terms_and_conditions.as_deref(), Some("Net 30"));
        assert_eq!(invoice.discount_type, "none");
    }

    #[tokio::test]
    async fn test_second_invoice_for_request_conflicts() {
        let (ledger, _, request_id) = ledger_with_request();
        ledger.create_invoice(request_id).await.unwrap();

        let result = ledger.create_invoice(request_id).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_payment_replay_is_ignored() {
        let (ledger, _, request_id) = ledger_with_request();
        let invoice = ledger.create_invoice(request_id).await.unwrap();

        let first = ledger
            .apply_payment(
                invoice.invoice_id,
                Some(Decimal::new(100, 0)),
                Some("pi_1".to_string()),
                &event("evt_1"),
            )
            .await
            .unwrap();
        assert!(matches!(first, MutationOutcome::Applied(_)));

        let replay = ledger
            .apply_payment(
                invoice.invoice_id,
                Some(Decimal::new(100, 0)),
                Some("pi_1".to_string()),
                &event("evt_1"),
            )
            .await
            .unwrap();
        assert!(matches!(replay, MutationOutcome::Duplicate));

        let stored = ledger.get_invoice(invoice.invoice_id).await.unwrap();
        assert_eq!(stored.amount_paid, Decimal::new(100, 0));
        assert_eq!(stored.status(), InvoiceStatus::PartiallyPaid);
        assert_eq!(stored.balance, stored.amount - stored.amount_paid);
    }

    #[tokio::test]
    async fn test_payment_without_amount_settles_balance() {
        let (ledger, _, request_id) = ledger_with_request();
        let invoice = ledger.create_invoice(request_id).await.unwrap();

        let outcome = ledger
            .apply_payment(invoice.invoice_id, None, None, &event("evt_full"))
            .await
            .unwrap();

        let MutationOutcome::Applied(paid) = outcome else {
            panic!("expected payment to apply");
        };
        assert_eq!(paid.status(), InvoiceStatus::Paid);
        assert_eq!(paid.balance, Decimal::ZERO);
        assert_eq!(paid.amount_paid, invoice.amount);
    }

    #[tokio::test]
    async fn test_refund_by_payment_intent() {
        let (ledger, _, request_id) = ledger_with_request();
        let invoice = ledger.create_invoice(request_id).await.unwrap();
        ledger
            .apply_payment(
                invoice.invoice_id,
                None,
                Some("pi_refund".to_string()),
                &event("evt_pay"),
            )
            .await
            .unwrap();

        let refund_event = ProcessedEvent {
            event_id: "evt_refund".to_string(),
            event_type: "charge.refunded".to_string(),
        };
        let outcome = ledger
            .mark_refunded("pi_refund", &refund_event)
            .await
            .unwrap();
        assert!(matches!(outcome, Some(MutationOutcome::Applied(_))));

        let stored = ledger.get_invoice(invoice.invoice_id).await.unwrap();
        assert_eq!(stored.status(), InvoiceStatus::Refunded);
        assert_eq!(stored.balance, Decimal::ZERO);

        let unknown = ledger.mark_refunded("pi_other", &refund_event).await.unwrap();
        assert!(unknown.is_none());
    }

    #[tokio::test]
    async fn test_update_invoice_po_guard() {
        let (ledger, _, request_id) = ledger_with_request();
        let invoice = ledger.create_invoice(request_id).await.unwrap();

        let patch = UpdateInvoice {
            po_number: Some("PO-ACME-7".to_string()),
            ..Default::default()
        };
        let updated = ledger.update_invoice(invoice.invoice_id, patch).await.unwrap();
        assert_eq!(updated.po_edit_counter, 1);

        let patch = UpdateInvoice {
            po_number: Some("PO-ACME-8".to_string()),
            ..Default::default()
        };
        let result = ledger.update_invoice(invoice.invoice_id, patch).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_update_invoice_rejects_negative_delay() {
        let (ledger, _, request_id) = ledger_with_request();
        let invoice = ledger.create_invoice(request_id).await.unwrap();

        let patch = UpdateInvoice {
            follow_up_delay_days: Some(-1),
            ..Default::default()
        };
        let result = ledger.update_invoice(invoice.invoice_id, patch).await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_recalculate_with_items() {
        let (ledger, _, request_id) = ledger_with_request();
        let invoice = ledger.create_invoice(request_id).await.unwrap();
        ledger
            .apply_payment(
                invoice.invoice_id,
                Some(invoice.amount),
                None,
                &event("evt_paid"),
            )
            .await
            .unwrap();

        let recalculated = ledger
            .recalculate_with_items(
                invoice.invoice_id,
                vec![CustomLineItemInput {
                    line_item_id: None,
                    description: "Late night surcharge".to_string(),
                    quantity: 1,
                    rate: Decimal::new(100, 0),
                }],
            )
            .await
            .unwrap();

        assert_eq!(recalculated.subtotal, Decimal::new(500, 0));
        assert_eq!(
            recalculated.balance,
            recalculated.amount - recalculated.amount_paid
        );
        assert_eq!(recalculated.status(), InvoiceStatus::PartiallyPaid);
    }

    #[tokio::test]
    async fn test_delete_missing_invoice() {
        let (ledger, _, _) = ledger_with_request();
        let result = ledger.delete_invoice(Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
