//! Invoice model for collections-service.

use super::{PriceBreakdown, StaffingRequest};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Remaining balance at or below which an invoice counts as settled.
pub const PAID_THRESHOLD: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

pub const DEFAULT_PAYMENT_TERMS: &str = "Due on receipt";

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Unpaid,
    PartiallyPaid,
    Paid,
    Refunded,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "unpaid" => InvoiceStatus::Unpaid,
            "partially_paid" => InvoiceStatus::PartiallyPaid,
            "paid" => InvoiceStatus::Paid,
            "refunded" => InvoiceStatus::Refunded,
            _ => InvoiceStatus::Pending,
        }
    }

    /// Statuses the overdue sweep chases.
    pub fn is_collectible(&self) -> bool {
        matches!(self, InvoiceStatus::Pending | InvoiceStatus::Unpaid)
    }
}

/// Invoice for a staffing request.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub request_id: Uuid,
    pub status: String,
    pub subtotal: Decimal,
    pub transaction_fee: Decimal,
    pub service_fee: Decimal,
    pub amount: Decimal,
    pub amount_paid: Decimal,
    pub balance: Decimal,
    pub due_date: DateTime<Utc>,
    pub po_number: String,
    pub po_edit_counter: i32,
    pub payment_intent: Option<String>,
    pub payment_terms: String,
    pub ship_to: Option<String>,
    pub notes: Option<String>,
    pub terms_and_conditions: Option<String>,
    pub discount_type: String,
    pub discount_value: Decimal,
    pub last_sent: Option<DateTime<Utc>>,
    pub follow_up_count: i32,
    pub follow_up_delay_days: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    /// Build a fresh `pending` invoice for a priced request.
    pub fn for_request(
        request: &StaffingRequest,
        breakdown: &PriceBreakdown,
        terms_and_conditions: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            invoice_id: Uuid::new_v4(),
            request_id: request.request_id,
            status: InvoiceStatus::Pending.as_str().to_string(),
            subtotal: breakdown.subtotal,
            transaction_fee: breakdown.transaction_fee,
            service_fee: breakdown.service_fee,
            amount: breakdown.total,
            amount_paid: Decimal::ZERO,
            balance: breakdown.total,
            due_date: request.start_date,
            po_number: default_po_number(request.request_id),
            po_edit_counter: 0,
            payment_intent: None,
            payment_terms: DEFAULT_PAYMENT_TERMS.to_string(),
            ship_to: request.event_location.clone(),
            notes: None,
            terms_and_conditions,
            discount_type: "none".to_string(),
            discount_value: Decimal::ZERO,
            last_sent: None,
            follow_up_count: 0,
            follow_up_delay_days: 0,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    pub fn set_status(&mut self, status: InvoiceStatus) {
        self.status = status.as_str().to_string();
    }

    /// Overwrite the priced amounts; `amount` always equals the breakdown total.
    pub fn apply_breakdown(&mut self, breakdown: &PriceBreakdown) {
        self.subtotal = breakdown.subtotal;
        self.transaction_fee = breakdown.transaction_fee;
        self.service_fee = breakdown.service_fee;
        self.amount = breakdown.total;
    }

    /// Recompute the balance and derive `paid` / `partially_paid` from it.
    pub fn settle(&mut self) {
        self.balance = self.amount - self.amount_paid;
        if self.balance <= PAID_THRESHOLD {
            self.balance = Decimal::ZERO;
            self.set_status(InvoiceStatus::Paid);
        } else {
            self.set_status(InvoiceStatus::PartiallyPaid);
        }
    }

    pub fn apply_payment(&mut self, settled_amount: Decimal, payment_intent: Option<String>) {
        self.amount_paid += settled_amount;
        if payment_intent.is_some() {
            self.payment_intent = payment_intent;
        }
        self.settle();
    }

    /// Unpaid or pending past the due date.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status().is_collectible() && self.due_date < now
    }

    pub fn record_follow_up(&mut self, now: DateTime<Utc>) {
        self.last_sent = Some(now);
        self.follow_up_count += 1;
    }

    /// Apply a patch. The PO number may change at most once over the invoice's life.
    pub fn apply_update(&mut self, patch: &UpdateInvoice) -> Result<(), AppError> {
        if let Some(po_number) = &patch.po_number {
            if *po_number != self.po_number {
                if self.po_edit_counter >= 1 {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "PO number has already been edited"
                    )));
                }
                self.po_number = po_number.clone();
                self.po_edit_counter = 1;
            }
        }

        if let Some(status) = patch.status {
            self.set_status(status);
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = due_date;
        }
        if let Some(notes) = &patch.notes {
            self.notes = Some(notes.clone());
        }
        if let Some(payment_terms) = &patch.payment_terms {
            self.payment_terms = payment_terms.clone();
        }
        if let Some(ship_to) = &patch.ship_to {
            self.ship_to = Some(ship_to.clone());
        }
        if let Some(terms) = &patch.terms_and_conditions {
            self.terms_and_conditions = Some(terms.clone());
        }
        if let Some(discount_type) = &patch.discount_type {
            self.discount_type = discount_type.clone();
        }
        if let Some(discount_value) = patch.discount_value {
            self.discount_value = discount_value;
        }
        if let Some(delay) = patch.follow_up_delay_days {
            self.follow_up_delay_days = delay;
        }

        Ok(())
    }
}

/// `PO-` followed by the first eight characters of the request id.
pub fn default_po_number(request_id: Uuid) -> String {
    let prefix: String = request_id.to_string().chars().take(8).collect();
    format!("PO-{}", prefix)
}

/// Input for updating an invoice. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateInvoice {
    #[validate(length(min = 1, max = 64))]
    pub po_number: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub due_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[validate(length(min = 1, max = 128))]
    pub payment_terms: Option<String>,
    pub ship_to: Option<String>,
    pub terms_and_conditions: Option<String>,
    #[validate(length(min = 1, max = 32))]
    pub discount_type: Option<String>,
    pub discount_value: Option<Decimal>,
    #[validate(range(min = 0, max = 365))]
    pub follow_up_delay_days: Option<i32>,
}
