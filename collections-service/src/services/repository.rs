//! Storage seams for the ledger and the pricing engine.
//!
//! `Database` (Postgres) implements both traits for production; `MockRepository`
//! keeps everything in memory for tests and local runs.

use crate::models::{CustomLineItem, Invoice, Rate, StaffLineItem, StaffingRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

/// In-place edit applied to a locked invoice row.
pub type InvoiceMutation = Box<dyn FnOnce(&mut Invoice) -> Result<(), AppError> + Send>;

/// Provider event recorded alongside the mutation it caused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
}

/// Result of an atomic read-modify-write.
#[derive(Debug, Clone)]
pub enum MutationOutcome {
    Applied(Invoice),
    /// The idempotency key was already recorded; nothing changed.
    Duplicate,
    NotFound,
}

#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    /// Insert a new invoice. Fails with `Conflict` if the request already has one.
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError>;
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;
    async fn get_invoice_by_request(&self, request_id: Uuid)
        -> Result<Option<Invoice>, AppError>;
    async fn find_invoice_id_by_payment_intent(
        &self,
        payment_intent: &str,
    ) -> Result<Option<Uuid>, AppError>;
    /// Pending or unpaid invoices with `due_date < now`.
    async fn list_overdue_invoices(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, AppError>;
    /// Lock the invoice, apply `mutation`, persist. When `event` is given it is recorded
    /// in the same unit of work and a repeat returns `Duplicate` without mutating.
    async fn modify_invoice(
        &self,
        invoice_id: Uuid,
        event: Option<&ProcessedEvent>,
        mutation: InvoiceMutation,
    ) -> Result<MutationOutcome, AppError>;
    async fn delete_invoice(&self, invoice_id: Uuid) -> Result<bool, AppError>;
    async fn health_check(&self) -> Result<(), AppError>;
}

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn get_request(&self, request_id: Uuid) -> Result<Option<StaffingRequest>, AppError>;
    async fn list_staff_line_items(&self, request_id: Uuid)
        -> Result<Vec<StaffLineItem>, AppError>;
    async fn list_custom_line_items(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<CustomLineItem>, AppError>;
    /// Update by id, creating the row if it does not exist yet.
    async fn upsert_custom_line_item(
        &self,
        item: &CustomLineItem,
    ) -> Result<CustomLineItem, AppError>;
    async fn find_branch_rate(
        &self,
        staff_type: &str,
        branch_id: Uuid,
    ) -> Result<Option<Rate>, AppError>;
    async fn find_any_branch_rate(&self, staff_type: &str) -> Result<Option<Rate>, AppError>;
}

fn poisoned<T>(_: T) -> AppError {
    AppError::InternalError(anyhow::anyhow!("Mock repository mutex poisoned"))
}

/// In-memory repository for tests.
#[derive(Default)]
pub struct MockRepository {
    pub invoices: Mutex<HashMap<Uuid, Invoice>>,
    pub processed_events: Mutex<HashSet<String>>,
    pub requests: Mutex<HashMap<Uuid, StaffingRequest>>,
    pub staff_line_items: Mutex<Vec<StaffLineItem>>,
    pub custom_line_items: Mutex<Vec<CustomLineItem>>,
    pub rates: Mutex<Vec<Rate>>,
}

impl MockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request(&self, request: StaffingRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.insert(request.request_id, request);
        }
    }

    pub fn add_staff_line_item(&self, item: StaffLineItem) {
        if let Ok(mut items) = self.staff_line_items.lock() {
            items.push(item);
        }
    }

    pub fn add_rate(&self, rate: Rate) {
        if let Ok(mut rates) = self.rates.lock() {
            rates.push(rate);
        }
    }
}

#[async_trait]
impl InvoiceRepository for MockRepository {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        let mut invoices = self.invoices.lock().map_err(poisoned)?;
        if invoices
            .values()
            .any(|existing| existing.request_id == invoice.request_id)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice already exists for request {}",
                invoice.request_id
            )));
        }
        invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(invoice.clone())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let invoices = self.invoices.lock().map_err(poisoned)?;
        Ok(invoices.get(&invoice_id).cloned())
    }

    async fn get_invoice_by_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let invoices = self.invoices.lock().map_err(poisoned)?;
        Ok(invoices
            .values()
            .find(|invoice| invoice.request_id == request_id)
            .cloned())
    }

    async fn find_invoice_id_by_payment_intent(
        &self,
        payment_intent: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let invoices = self.invoices.lock().map_err(poisoned)?;
        Ok(invoices
            .values()
            .find(|invoice| invoice.payment_intent.as_deref() == Some(payment_intent))
            .map(|invoice| invoice.invoice_id))
    }

    async fn list_overdue_invoices(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, AppError> {
        let invoices = self.invoices.lock().map_err(poisoned)?;
        let mut overdue: Vec<Invoice> = invoices
            .values()
            .filter(|invoice| invoice.is_overdue(now))
            .cloned()
            .collect();
        overdue.sort_by_key(|invoice| invoice.due_date);
        Ok(overdue)
    }

    async fn modify_invoice(
        &self,
        invoice_id: Uuid,
        event: Option<&ProcessedEvent>,
        mutation: InvoiceMutation,
    ) -> Result<MutationOutcome, AppError> {
        // Both locks are held for the whole read-modify-write.
        let mut invoices = self.invoices.lock().map_err(poisoned)?;
        let mut processed = self.processed_events.lock().map_err(poisoned)?;

        if let Some(event) = event {
            if processed.contains(&event.event_id) {
                return Ok(MutationOutcome::Duplicate);
            }
        }

        let Some(current) = invoices.get(&invoice_id) else {
            return Ok(MutationOutcome::NotFound);
        };

        let mut updated = current.clone();
        mutation(&mut updated)?;
        updated.updated_utc = Utc::now();

        if let Some(event) = event {
            processed.insert(event.event_id.clone());
        }
        invoices.insert(invoice_id, updated.clone());

        Ok(MutationOutcome::Applied(updated))
    }

    async fn delete_invoice(&self, invoice_id: Uuid) -> Result<bool, AppError> {
        let mut invoices = self.invoices.lock().map_err(poisoned)?;
        Ok(invoices.remove(&invoice_id).is_some())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[async_trait]
impl RequestRepository for MockRepository {
    async fn get_request(&self, request_id: Uuid) -> Result<Option<StaffingRequest>, AppError> {
        let requests = self.requests.lock().map_err(poisoned)?;
        Ok(requests.get(&request_id).cloned())
    }

    async fn list_staff_line_items(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<StaffLineItem>, AppError> {
        let items = self.staff_line_items.lock().map_err(poisoned)?;
        Ok(items
            .iter()
            .filter(|item| item.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn list_custom_line_items(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<CustomLineItem>, AppError> {
        let items = self.custom_line_items.lock().map_err(poisoned)?;
        Ok(items
            .iter()
            .filter(|item| item.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn upsert_custom_line_item(
        &self,
        item: &CustomLineItem,
    ) -> Result<CustomLineItem, AppError> {
        let mut items = self.custom_line_items.lock().map_err(poisoned)?;
        match items
            .iter_mut()
            .find(|existing| existing.line_item_id == item.line_item_id)
        {
            Some(existing) if existing.request_id != item.request_id => {
                Err(AppError::Conflict(anyhow::anyhow!(
                    "Line item {} belongs to another request",
                    item.line_item_id
                )))
            }
            Some(existing) => {
                existing.description = item.description.clone();
                existing.quantity = item.quantity;
                existing.rate = item.rate;
                existing.total = item.total;
                existing.updated_utc = item.updated_utc;
                Ok(existing.clone())
            }
            None => {
                items.push(item.clone());
                Ok(item.clone())
            }
        }
    }

    async fn find_branch_rate(
        &self,
        staff_type: &str,
        branch_id: Uuid,
    ) -> Result<Option<Rate>, AppError> {
        let rates = self.rates.lock().map_err(poisoned)?;
        Ok(rates
            .iter()
            .find(|rate| rate.staff_type == staff_type && rate.branch_id == branch_id)
            .cloned())
    }

    async fn find_any_branch_rate(&self, staff_type: &str) -> Result<Option<Rate>, AppError> {
        let rates = self.rates.lock().map_err(poisoned)?;
        Ok(rates
            .iter()
            .find(|rate| rate.staff_type == staff_type)
            .cloned())
    }
}
