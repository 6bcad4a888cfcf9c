//! Email and follow-up handlers.

use super::record_error;
use crate::models::{EmailAttachment, EmailHeaders, Invoice, ScheduledEmail};
use crate::services::{BatchReport, ScheduleEmailRequest};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CustomFollowUpRequest {
    pub content: String,
    #[serde(default)]
    pub headers: EmailHeaders,
    #[serde(default)]
    pub include_payment_link: bool,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentPayload {
    pub filename: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Base64-encoded file content.
    pub data: String,
}

fn default_content_type() -> String {
    "application/pdf".to_string()
}

#[derive(Debug, Deserialize)]
pub struct InvoiceEmailRequest {
    pub content: String,
    #[serde(default)]
    pub headers: EmailHeaders,
    #[serde(default)]
    pub include_payment_link: bool,
    pub attachment: Option<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerFollowUpsRequest {
    pub delay_days: i32,
}

#[derive(Debug, Serialize)]
pub struct TriggerFollowUpsResponse {
    pub delay_days: i32,
    pub processed: usize,
    #[serde(flatten)]
    pub report: BatchReport,
}

impl AttachmentPayload {
    fn decode(self) -> Result<EmailAttachment, AppError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid attachment data: {}", e)))?;
        Ok(EmailAttachment {
            filename: self.filename,
            content_type: self.content_type,
            data,
        })
    }
}

/// POST /requests/:request_id/scheduled-emails
pub async fn schedule_email(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<ScheduleEmailRequest>,
) -> Result<(StatusCode, Json<ScheduledEmail>), AppError> {
    let scheduled = state
        .scheduler
        .schedule_email(request_id, body, Utc::now())
        .await
        .map_err(record_error)?;
    Ok((StatusCode::CREATED, Json(scheduled)))
}

/// POST /invoices/:id/follow-up
pub async fn send_custom_follow_up(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Json(body): Json<CustomFollowUpRequest>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = state
        .scheduler
        .send_custom_follow_up(
            invoice_id,
            &body.content,
            body.headers,
            body.include_payment_link,
            Utc::now(),
        )
        .await
        .map_err(record_error)?;
    Ok(Json(invoice))
}

/// POST /invoices/:id/email
pub async fn send_invoice_email(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Json(body): Json<InvoiceEmailRequest>,
) -> Result<StatusCode, AppError> {
    let attachment = body
        .attachment
        .map(AttachmentPayload::decode)
        .transpose()
        .map_err(record_error)?;

    state
        .scheduler
        .send_invoice_email(
            invoice_id,
            &body.content,
            body.headers,
            attachment,
            body.include_payment_link,
        )
        .await
        .map_err(record_error)?;

    Ok(StatusCode::ACCEPTED)
}

/// POST /admin/follow-ups/trigger
pub async fn trigger_follow_ups(
    State(state): State<AppState>,
    Json(body): Json<TriggerFollowUpsRequest>,
) -> Result<Json<TriggerFollowUpsResponse>, AppError> {
    if body.delay_days < 0 {
        return Err(record_error(AppError::BadRequest(anyhow::anyhow!(
            "delay_days must not be negative"
        ))));
    }

    let report = state
        .scheduler
        .trigger_by_delay(body.delay_days, Utc::now())
        .await
        .map_err(record_error)?;

    Ok(Json(TriggerFollowUpsResponse {
        delay_days: body.delay_days,
        processed: report.succeeded,
        report,
    }))
}
