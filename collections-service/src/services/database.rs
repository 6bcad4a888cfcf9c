//! Database service for collections-service.

use crate::models::{CustomLineItem, Invoice, Rate, StaffLineItem, StaffingRequest};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{
    InvoiceMutation, InvoiceRepository, MutationOutcome, ProcessedEvent, RequestRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "collections-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// ---- Invoice Operations ----

#[async_trait]
impl InvoiceRepository for Database {
    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id, request_id = %invoice.request_id))]
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let result = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (
                invoice_id, request_id, status, subtotal, transaction_fee, service_fee,
                amount, amount_paid, balance, due_date, po_number, po_edit_counter,
                payment_intent, payment_terms, ship_to, notes, terms_and_conditions,
                discount_type, discount_value, last_sent, follow_up_count,
                follow_up_delay_days, created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24)
            RETURNING *
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.request_id)
        .bind(&invoice.status)
        .bind(invoice.subtotal)
        .bind(invoice.transaction_fee)
        .bind(invoice.service_fee)
        .bind(invoice.amount)
        .bind(invoice.amount_paid)
        .bind(invoice.balance)
        .bind(invoice.due_date)
        .bind(&invoice.po_number)
        .bind(invoice.po_edit_counter)
        .bind(&invoice.payment_intent)
        .bind(&invoice.payment_terms)
        .bind(&invoice.ship_to)
        .bind(&invoice.notes)
        .bind(&invoice.terms_and_conditions)
        .bind(&invoice.discount_type)
        .bind(invoice.discount_value)
        .bind(invoice.last_sent)
        .bind(invoice.follow_up_count)
        .bind(invoice.follow_up_delay_days)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .fetch_one(&self.pool)
        .await;

        timer.observe_duration();

        match result {
            Ok(created) => {
                info!(invoice_id = %created.invoice_id, "Invoice created");
                Ok(created)
            }
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                Err(AppError::Conflict(anyhow::anyhow!(
                    "Invoice already exists for request {}",
                    invoice.request_id
                )))
            }
            Err(e) => Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to create invoice: {}",
                e
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn get_invoice_by_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_by_request"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice by request: {}", e))
        })?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn find_invoice_id_by_payment_intent(
        &self,
        payment_intent: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice_by_payment_intent"])
            .start_timer();

        let invoice_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT invoice_id FROM invoices WHERE payment_intent = $1
            ORDER BY created_utc DESC
            LIMIT 1
            "#,
        )
        .bind(payment_intent)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to find invoice by payment intent: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(invoice_id)
    }

    #[instrument(skip(self))]
    async fn list_overdue_invoices(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_overdue_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE status IN ('unpaid', 'pending') AND due_date < $1
            ORDER BY due_date ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list overdue invoices: {}", e))
        })?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self, event, mutation), fields(event_id = ?event.map(|e| e.event_id.as_str())))]
    async fn modify_invoice(
        &self,
        invoice_id: Uuid,
        event: Option<&ProcessedEvent>,
        mutation: InvoiceMutation,
    ) -> Result<MutationOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["modify_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Claim the idempotency key first; a concurrent duplicate blocks on the
        // primary key until this transaction resolves.
        if let Some(event) = event {
            let claimed = sqlx::query(
                r#"
                INSERT INTO processed_webhook_events (event_id, event_type, invoice_id, processed_utc)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(&event.event_id)
            .bind(&event.event_type)
            .bind(invoice_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to record webhook event: {}", e))
            })?;

            if claimed.rows_affected() == 0 {
                tx.rollback().await.ok();
                timer.observe_duration();
                info!(event_id = %event.event_id, "Webhook event already processed");
                return Ok(MutationOutcome::Duplicate);
            }
        }

        let current = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices WHERE invoice_id = $1 FOR UPDATE
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoice: {}", e)))?;

        let Some(mut invoice) = current else {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(MutationOutcome::NotFound);
        };

        if let Err(e) = mutation(&mut invoice) {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Err(e);
        }

        let updated = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices SET
                status = $2,
                subtotal = $3,
                transaction_fee = $4,
                service_fee = $5,
                amount = $6,
                amount_paid = $7,
                balance = $8,
                due_date = $9,
                po_number = $10,
                po_edit_counter = $11,
                payment_intent = $12,
                payment_terms = $13,
                ship_to = $14,
                notes = $15,
                terms_and_conditions = $16,
                discount_type = $17,
                discount_value = $18,
                last_sent = $19,
                follow_up_count = $20,
                follow_up_delay_days = $21,
                updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING *
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(&invoice.status)
        .bind(invoice.subtotal)
        .bind(invoice.transaction_fee)
        .bind(invoice.service_fee)
        .bind(invoice.amount)
        .bind(invoice.amount_paid)
        .bind(invoice.balance)
        .bind(invoice.due_date)
        .bind(&invoice.po_number)
        .bind(invoice.po_edit_counter)
        .bind(&invoice.payment_intent)
        .bind(&invoice.payment_terms)
        .bind(&invoice.ship_to)
        .bind(&invoice.notes)
        .bind(&invoice.terms_and_conditions)
        .bind(&invoice.discount_type)
        .bind(invoice.discount_value)
        .bind(invoice.last_sent)
        .bind(invoice.follow_up_count)
        .bind(invoice.follow_up_delay_days)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(MutationOutcome::Applied(updated))
    }

    #[instrument(skip(self))]
    async fn delete_invoice(&self, invoice_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_invoice"])
            .start_timer();

        let result = sqlx::query(
            r#"
            DELETE FROM invoices WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete invoice: {}", e)))?;

        timer.observe_duration();

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(invoice_id = %invoice_id, "Invoice deleted");
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }
}

// ---- Request, Line Item and Rate Operations ----

#[async_trait]
impl RequestRepository for Database {
    #[instrument(skip(self))]
    async fn get_request(&self, request_id: Uuid) -> Result<Option<StaffingRequest>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_request"])
            .start_timer();

        let request = sqlx::query_as::<_, StaffingRequest>(
            r#"
            SELECT request_id, branch_id, first_name, last_name, email, event_location,
                   start_date, created_utc
            FROM staffing_requests
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get request: {}", e)))?;

        timer.observe_duration();
        Ok(request)
    }

    #[instrument(skip(self))]
    async fn list_staff_line_items(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<StaffLineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_staff_line_items"])
            .start_timer();

        let items = sqlx::query_as::<_, StaffLineItem>(
            r#"
            SELECT line_item_id, request_id, staff_type AS position, count, hourly_rate,
                   start_time, end_time, shift_date
            FROM staff_line_items
            WHERE request_id = $1
            ORDER BY shift_date ASC, start_time ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list staff line items: {}", e))
        })?;

        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn list_custom_line_items(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<CustomLineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_custom_line_items"])
            .start_timer();

        let items = sqlx::query_as::<_, CustomLineItem>(
            r#"
            SELECT line_item_id, request_id, description, quantity, rate, total,
                   created_utc, updated_utc
            FROM custom_line_items
            WHERE request_id = $1
            ORDER BY created_utc ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list custom line items: {}", e))
        })?;

        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self, item), fields(line_item_id = %item.line_item_id, request_id = %item.request_id))]
    async fn upsert_custom_line_item(
        &self,
        item: &CustomLineItem,
    ) -> Result<CustomLineItem, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_custom_line_item"])
            .start_timer();

        // The WHERE guard keeps an id from another request from being overwritten.
        let saved = sqlx::query_as::<_, CustomLineItem>(
            r#"
            INSERT INTO custom_line_items (
                line_item_id, request_id, description, quantity, rate, total,
                created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (line_item_id) DO UPDATE SET
                description = EXCLUDED.description,
                quantity = EXCLUDED.quantity,
                rate = EXCLUDED.rate,
                total = EXCLUDED.total,
                updated_utc = EXCLUDED.updated_utc
            WHERE custom_line_items.request_id = EXCLUDED.request_id
            RETURNING line_item_id, request_id, description, quantity, rate, total,
                      created_utc, updated_utc
            "#,
        )
        .bind(item.line_item_id)
        .bind(item.request_id)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.rate)
        .bind(item.total)
        .bind(item.created_utc)
        .bind(item.updated_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to save custom line item: {}", e))
        })?;

        timer.observe_duration();

        saved.ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!(
                "Line item {} belongs to another request",
                item.line_item_id
            ))
        })
    }

    #[instrument(skip(self))]
    async fn find_branch_rate(
        &self,
        staff_type: &str,
        branch_id: Uuid,
    ) -> Result<Option<Rate>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_branch_rate"])
            .start_timer();

        let rate = sqlx::query_as::<_, Rate>(
            r#"
            SELECT rate_id, staff_type, branch_id, hourly_rate
            FROM rates
            WHERE staff_type = $1 AND branch_id = $2
            "#,
        )
        .bind(staff_type)
        .bind(branch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get rate: {}", e)))?;

        timer.observe_duration();
        Ok(rate)
    }

    #[instrument(skip(self))]
    async fn find_any_branch_rate(&self, staff_type: &str) -> Result<Option<Rate>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_any_branch_rate"])
            .start_timer();

        let rate = sqlx::query_as::<_, Rate>(
            r#"
            SELECT rate_id, staff_type, branch_id, hourly_rate
            FROM rates
            WHERE staff_type = $1
            ORDER BY hourly_rate DESC
            LIMIT 1
            "#,
        )
        .bind(staff_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get fallback rate: {}", e))
        })?;

        timer.observe_duration();
        Ok(rate)
    }
}
