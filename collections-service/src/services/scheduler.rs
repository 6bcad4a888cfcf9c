//! Follow-up scheduler.
//!
//! One ticker drives both the scheduled-email due-queue and the overdue invoice
//! sweep. The two run sequentially inside a tick and a tick always finishes before
//! shutdown completes.

use crate::config::SchedulerConfig;
use crate::models::{EmailAttachment, EmailHeaders, Invoice, ScheduledEmail, StaffingRequest};
use crate::services::due_queue::DueQueue;
use crate::services::email::{EmailMessage, EmailSender};
use crate::services::ledger::InvoiceLedger;
use crate::services::metrics::{FOLLOW_UPS_TOTAL, SCHEDULED_EMAILS_TOTAL};
use crate::services::stripe::PaymentProvider;
use crate::services::templates;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Extra lifetime of a scheduled email blob past its send time.
const BLOB_GRACE_HOURS: i64 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowUpPolicy {
    /// Used when an invoice has no delay of its own.
    pub default_delay_days: i64,
    pub renotify_interval_days: i64,
}

impl Default for FollowUpPolicy {
    fn default() -> Self {
        Self {
            default_delay_days: 1,
            renotify_interval_days: 5,
        }
    }
}

impl From<&SchedulerConfig> for FollowUpPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            default_delay_days: config.default_delay_days,
            renotify_interval_days: config.renotify_interval_days,
        }
    }
}

/// Whether an overdue invoice is due for another reminder at `now`.
pub fn should_send_follow_up(invoice: &Invoice, now: DateTime<Utc>, policy: &FollowUpPolicy) -> bool {
    if !invoice.status().is_collectible() {
        return false;
    }

    let delay_days = if invoice.follow_up_delay_days > 0 {
        i64::from(invoice.follow_up_delay_days)
    } else {
        policy.default_delay_days
    };

    if now - invoice.due_date < ChronoDuration::days(delay_days) {
        return false;
    }

    match invoice.last_sent {
        None => true,
        Some(last_sent) => now - last_sent >= ChronoDuration::days(policy.renotify_interval_days),
    }
}

/// Per-batch tally. Individual failures never fail the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEmailRequest {
    pub send_at: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub headers: EmailHeaders,
    #[serde(default)]
    pub include_payment_link: bool,
}

pub struct FollowUpScheduler {
    ledger: InvoiceLedger,
    queue: Arc<dyn DueQueue>,
    email: Arc<dyn EmailSender>,
    payments: Arc<dyn PaymentProvider>,
    policy: FollowUpPolicy,
    support_reply_to: String,
    tick_interval: Duration,
}

/// Running ticker. Dropping it without `stop()` leaves the task running.
pub struct SchedulerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Cancel the ticker and wait for an in-flight tick to finish.
    pub async fn stop(self) {
        info!("Stopping follow-up scheduler");
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Follow-up scheduler task ended abnormally");
        }
        info!("Follow-up scheduler stopped");
    }
}

impl FollowUpScheduler {
    pub fn new(
        ledger: InvoiceLedger,
        queue: Arc<dyn DueQueue>,
        email: Arc<dyn EmailSender>,
        payments: Arc<dyn PaymentProvider>,
        config: &SchedulerConfig,
        support_reply_to: String,
    ) -> Self {
        Self {
            ledger,
            queue,
            email,
            payments,
            policy: FollowUpPolicy::from(config),
            support_reply_to,
            tick_interval: Duration::from_secs(config.tick_seconds.max(1)),
        }
    }

    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let token = CancellationToken::new();
        let shutdown = token.clone();

        info!(
            tick_seconds = self.tick_interval.as_secs(),
            "Starting follow-up scheduler"
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Follow-up scheduler shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.tick(Utc::now()).await;
                    }
                }
            }
        });

        SchedulerHandle { token, task }
    }

    /// One scheduler pass: drain due emails, then sweep overdue invoices.
    pub async fn tick(&self, now: DateTime<Utc>) {
        match self.drain_due_queue(now).await {
            Ok(report) if report != BatchReport::default() => {
                info!(
                    succeeded = report.succeeded,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Scheduled emails processed"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to drain scheduled emails"),
        }

        match self.run_overdue_sweep(now).await {
            Ok(report) if report != BatchReport::default() => {
                info!(
                    succeeded = report.succeeded,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Overdue follow-ups processed"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to run overdue sweep"),
        }
    }

    /// Render and queue an email for later delivery.
    #[instrument(skip(self, request), fields(send_at = %request.send_at))]
    pub async fn schedule_email(
        &self,
        request_id: Uuid,
        request: ScheduleEmailRequest,
        now: DateTime<Utc>,
    ) -> Result<ScheduledEmail, AppError> {
        if request.send_at < now {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "send_at must not be in the past"
            )));
        }
        if request.content.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("content is required")));
        }

        let staffing_request = self.ledger.request_for(request_id).await?;

        let (payment_url, balance) = if request.include_payment_link {
            let invoice = self.ledger.get_invoice_by_request(request_id).await?;
            (
                self.payment_link(&invoice, &staffing_request).await,
                invoice.balance,
            )
        } else {
            (None, Default::default())
        };

        let scheduled = ScheduledEmail {
            email_id: Uuid::new_v4(),
            request_id,
            subject: request
                .headers
                .subject
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| templates::default_subject(request_id)),
            content: templates::wrap_content(&request.content, payment_url.as_deref(), balance),
            reply_to: request
                .headers
                .reply_to
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| self.support_reply_to.clone()),
            cc: request.headers.cc,
            bcc: request.headers.bcc,
            send_at: request.send_at,
            created_utc: now,
            updated_utc: now,
        };

        let ttl_seconds =
            (request.send_at - now).num_seconds() + ChronoDuration::hours(BLOB_GRACE_HOURS).num_seconds();
        self.queue.enqueue(&scheduled, ttl_seconds).await?;

        SCHEDULED_EMAILS_TOTAL.with_label_values(&["scheduled"]).inc();
        info!(
            email_id = %scheduled.email_id,
            request_id = %request_id,
            "Email scheduled"
        );

        Ok(scheduled)
    }

    /// Send every queued email whose time has come.
    #[instrument(skip(self))]
    pub async fn drain_due_queue(&self, now: DateTime<Utc>) -> Result<BatchReport, AppError> {
        let due = self.queue.due_ids(now).await?;
        let mut report = BatchReport::default();

        for email_id in due {
            let outcome = self.deliver_scheduled(email_id, now).await;
            let label = match outcome {
                Delivery::Sent => {
                    report.succeeded += 1;
                    "sent"
                }
                Delivery::NotYetDue => {
                    report.skipped += 1;
                    "skipped"
                }
                Delivery::Failed => {
                    report.failed += 1;
                    "failed"
                }
            };
            SCHEDULED_EMAILS_TOTAL.with_label_values(&[label]).inc();
        }

        Ok(report)
    }

    async fn deliver_scheduled(&self, email_id: Uuid, now: DateTime<Utc>) -> Delivery {
        let scheduled = match self.queue.load(email_id).await {
            Ok(Some(scheduled)) => scheduled,
            Ok(None) => {
                warn!(email_id = %email_id, "Scheduled email blob missing; dropping entry");
                if let Err(e) = self.queue.unschedule(email_id).await {
                    warn!(email_id = %email_id, error = %e, "Failed to drop orphaned entry");
                }
                return Delivery::Failed;
            }
            Err(e) => {
                error!(email_id = %email_id, error = %e, "Failed to load scheduled email");
                return Delivery::Failed;
            }
        };

        if scheduled.send_at > now {
            return Delivery::NotYetDue;
        }

        let recipient = match self.client_email(scheduled.request_id).await {
            Ok(recipient) => recipient,
            Err(e) => {
                error!(
                    email_id = %email_id,
                    request_id = %scheduled.request_id,
                    error = %e,
                    "Cannot resolve recipient for scheduled email"
                );
                return Delivery::Failed;
            }
        };

        let message = EmailMessage {
            to: recipient,
            subject: scheduled.subject.clone(),
            body_html: scheduled.content.clone(),
            reply_to: Some(scheduled.reply_to.clone()),
            cc: scheduled.cc.clone(),
            bcc: scheduled.bcc.clone(),
            attachment: None,
        };

        if let Err(e) = self.email.send(&message).await {
            error!(email_id = %email_id, error = %e, "Failed to send scheduled email");
            return Delivery::Failed;
        }

        if let Err(e) = self.queue.remove(email_id).await {
            warn!(email_id = %email_id, error = %e, "Sent scheduled email but cleanup failed");
        }

        info!(email_id = %email_id, request_id = %scheduled.request_id, "Scheduled email sent");
        Delivery::Sent
    }

    /// Remind every overdue invoice that is due for a follow-up.
    #[instrument(skip(self))]
    pub async fn run_overdue_sweep(&self, now: DateTime<Utc>) -> Result<BatchReport, AppError> {
        let overdue = self.ledger.overdue_invoices(now).await?;
        let mut report = BatchReport::default();

        for invoice in overdue {
            if !should_send_follow_up(&invoice, now, &self.policy) {
                report.skipped += 1;
                continue;
            }
            match self.send_follow_up(&invoice, now, "sweep").await {
                Ok(_) => report.succeeded += 1,
                Err(_) => report.failed += 1,
            }
        }

        Ok(report)
    }

    /// Remind overdue invoices configured with exactly `delay_days`, regardless of
    /// when they were last reminded.
    #[instrument(skip(self))]
    pub async fn trigger_by_delay(
        &self,
        delay_days: i32,
        now: DateTime<Utc>,
    ) -> Result<BatchReport, AppError> {
        let overdue = self.ledger.overdue_invoices(now).await?;
        let mut report = BatchReport::default();

        for invoice in overdue {
            if invoice.follow_up_delay_days != delay_days {
                report.skipped += 1;
                continue;
            }
            match self.send_follow_up(&invoice, now, "manual").await {
                Ok(_) => report.succeeded += 1,
                Err(_) => report.failed += 1,
            }
        }

        info!(
            delay_days = delay_days,
            processed = report.succeeded,
            failed = report.failed,
            "Follow-ups triggered by delay"
        );

        Ok(report)
    }

    /// Send the standard reminder for one invoice and record it.
    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id))]
    pub async fn send_follow_up(
        &self,
        invoice: &Invoice,
        now: DateTime<Utc>,
        kind: &str,
    ) -> Result<Invoice, AppError> {
        let result = self.send_follow_up_inner(invoice, now).await;
        let outcome = if result.is_ok() { "sent" } else { "failed" };
        FOLLOW_UPS_TOTAL.with_label_values(&[kind, outcome]).inc();

        if let Err(e) = &result {
            error!(invoice_id = %invoice.invoice_id, error = %e, "Follow-up failed");
        }
        result
    }

    async fn send_follow_up_inner(
        &self,
        invoice: &Invoice,
        now: DateTime<Utc>,
    ) -> Result<Invoice, AppError> {
        let request = self.ledger.request_for(invoice.request_id).await?;
        let to = recipient_of(&request)?;
        let payment_url = self.payment_link(invoice, &request).await;

        let message = EmailMessage {
            to,
            subject: templates::follow_up_subject(invoice.request_id),
            body_html: templates::follow_up_html(invoice, &request, payment_url.as_deref(), now),
            reply_to: Some(self.support_reply_to.clone()),
            cc: Vec::new(),
            bcc: Vec::new(),
            attachment: None,
        };
        self.email.send(&message).await?;

        let updated = self.ledger.record_follow_up(invoice.invoice_id, now).await?;
        info!(
            invoice_id = %invoice.invoice_id,
            follow_up_count = updated.follow_up_count,
            "Follow-up sent"
        );
        Ok(updated)
    }

    /// Send operator-written content to the client now and count it as a follow-up.
    #[instrument(skip(self, content, headers))]
    pub async fn send_custom_follow_up(
        &self,
        invoice_id: Uuid,
        content: &str,
        headers: EmailHeaders,
        include_payment_link: bool,
        now: DateTime<Utc>,
    ) -> Result<Invoice, AppError> {
        let result = async {
            let invoice = self.ledger.get_invoice(invoice_id).await?;
            self.send_immediate(&invoice, content, headers, None, include_payment_link)
                .await?;
            self.ledger.record_follow_up(invoice_id, now).await
        }
        .await;

        let outcome = if result.is_ok() { "sent" } else { "failed" };
        FOLLOW_UPS_TOTAL.with_label_values(&["custom", outcome]).inc();
        result
    }

    /// Email an invoice (optionally with a rendered document attached).
    #[instrument(skip(self, content, headers, attachment))]
    pub async fn send_invoice_email(
        &self,
        invoice_id: Uuid,
        content: &str,
        headers: EmailHeaders,
        attachment: Option<EmailAttachment>,
        include_payment_link: bool,
    ) -> Result<(), AppError> {
        let invoice = self.ledger.get_invoice(invoice_id).await?;
        self.send_immediate(&invoice, content, headers, attachment, include_payment_link)
            .await?;
        info!(invoice_id = %invoice_id, "Invoice email sent");
        Ok(())
    }

    async fn send_immediate(
        &self,
        invoice: &Invoice,
        content: &str,
        headers: EmailHeaders,
        attachment: Option<EmailAttachment>,
        include_payment_link: bool,
    ) -> Result<(), AppError> {
        if content.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("content is required")));
        }

        let request = self.ledger.request_for(invoice.request_id).await?;
        let to = recipient_of(&request)?;
        let payment_url = if include_payment_link {
            self.payment_link(invoice, &request).await
        } else {
            None
        };

        let message = EmailMessage {
            to,
            subject: headers
                .subject
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| templates::default_subject(invoice.request_id)),
            body_html: templates::wrap_content(content, payment_url.as_deref(), invoice.balance),
            reply_to: Some(
                headers
                    .reply_to
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| self.support_reply_to.clone()),
            ),
            cc: headers.cc,
            bcc: headers.bcc,
            attachment,
        };

        self.email.send(&message).await?;
        Ok(())
    }

    /// Checkout URL for the invoice, or `None` when the provider cannot produce one.
    async fn payment_link(&self, invoice: &Invoice, request: &StaffingRequest) -> Option<String> {
        match self.payments.create_checkout_session(invoice, request).await {
            Ok(session) => Some(session.url),
            Err(e) => {
                warn!(
                    invoice_id = %invoice.invoice_id,
                    error = %e,
                    "Could not create payment link; sending without one"
                );
                None
            }
        }
    }

    async fn client_email(&self, request_id: Uuid) -> Result<String, AppError> {
        let invoice = self.ledger.get_invoice_by_request(request_id).await?;
        let request = self.ledger.request_for(invoice.request_id).await?;
        recipient_of(&request)
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.queue.health_check().await?;
        Ok(())
    }
}

enum Delivery {
    Sent,
    NotYetDue,
    Failed,
}

fn recipient_of(request: &StaffingRequest) -> Result<String, AppError> {
    let email = request.email.trim();
    if email.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Request {} has no client email",
            request.request_id
        )));
    }
    Ok(email.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceBreakdown;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn overdue_invoice(now: DateTime<Utc>, days_past_due: i64) -> Invoice {
        let request = StaffingRequest {
            request_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            event_location: None,
            start_date: now - ChronoDuration::days(days_past_due),
            created_utc: now,
        };
        let breakdown = PriceBreakdown {
            subtotal: Decimal::new(100, 0),
            transaction_fee: Decimal::ZERO,
            service_fee: Decimal::ZERO,
            total: Decimal::new(100, 0),
        };
        Invoice::for_request(&request, &breakdown, None, now)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_eligible_when_past_delay_and_never_sent() {
        let now = now();
        let mut invoice = overdue_invoice(now, 10);
        invoice.follow_up_delay_days = 7;

        assert!(should_send_follow_up(&invoice, now, &FollowUpPolicy::default()));
    }

    #[test]
    fn test_not_eligible_before_delay() {
        let now = now();
        let mut invoice = overdue_invoice(now, 3);
        invoice.follow_up_delay_days = 7;

        assert!(!should_send_follow_up(&invoice, now, &FollowUpPolicy::default()));
    }

    #[test]
    fn test_zero_delay_uses_policy_default() {
        let now = now();
        let policy = FollowUpPolicy {
            default_delay_days: 2,
            renotify_interval_days: 5,
        };

        let invoice = overdue_invoice(now, 1);
        assert!(!should_send_follow_up(&invoice, now, &policy));

        let invoice = overdue_invoice(now, 2);
        assert!(should_send_follow_up(&invoice, now, &policy));
    }

    #[test]
    fn test_renotify_interval() {
        let now = now();
        let mut invoice = overdue_invoice(now, 30);
        invoice.last_sent = Some(now - ChronoDuration::days(2));
        assert!(!should_send_follow_up(&invoice, now, &FollowUpPolicy::default()));

        invoice.last_sent = Some(now - ChronoDuration::days(5));
        assert!(should_send_follow_up(&invoice, now, &FollowUpPolicy::default()));
    }

    #[test]
    fn test_paid_invoice_never_eligible() {
        let now = now();
        let mut invoice = overdue_invoice(now, 30);
        invoice.apply_payment(invoice.amount, None);

        assert!(!should_send_follow_up(&invoice, now, &FollowUpPolicy::default()));
    }
}
