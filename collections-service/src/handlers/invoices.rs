//! Invoice ledger handlers.

use super::record_error;
use crate::models::{CustomLineItemInput, Invoice, UpdateInvoice};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct LineItemsRequest {
    #[serde(default)]
    pub items: Vec<CustomLineItemInput>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub invoice_id: Uuid,
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub invoice_id: Uuid,
    pub refund_id: String,
}

/// POST /requests/:request_id/invoice
pub async fn create_invoice(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Invoice>), AppError> {
    let invoice = state
        .ledger
        .create_invoice(request_id)
        .await
        .map_err(record_error)?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

/// GET /requests/:request_id/invoice
pub async fn get_invoice_by_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = state
        .ledger
        .get_invoice_by_request(request_id)
        .await
        .map_err(record_error)?;
    Ok(Json(invoice))
}

/// GET /invoices/:id
pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = state
        .ledger
        .get_invoice(invoice_id)
        .await
        .map_err(record_error)?;
    Ok(Json(invoice))
}

/// PATCH /invoices/:id
pub async fn update_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Json(patch): Json<UpdateInvoice>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = state
        .ledger
        .update_invoice(invoice_id, patch)
        .await
        .map_err(record_error)?;
    Ok(Json(invoice))
}

/// DELETE /invoices/:id
pub async fn delete_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state
        .ledger
        .delete_invoice(invoice_id)
        .await
        .map_err(record_error)?;
    tracing::info!(invoice_id = %invoice_id, "Invoice deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /invoices/:id/recalculate
pub async fn recalculate_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Json(body): Json<LineItemsRequest>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = state
        .ledger
        .recalculate_with_items(invoice_id, body.items)
        .await
        .map_err(record_error)?;
    Ok(Json(invoice))
}

/// POST /invoices/:id/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<CheckoutResponse>, AppError> {
    let result = async {
        let invoice = state.ledger.get_invoice(invoice_id).await?;
        if invoice.balance <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Invoice {} has no outstanding balance",
                invoice_id
            )));
        }
        let request = state.ledger.request_for(invoice.request_id).await?;
        let session = state
            .payments
            .create_checkout_session(&invoice, &request)
            .await?;
        Ok(CheckoutResponse {
            invoice_id,
            session_id: session.id,
            url: session.url,
        })
    }
    .await
    .map_err(record_error)?;

    Ok(Json(result))
}

/// POST /invoices/:id/refund
///
/// Only asks the provider to refund; the ledger flips to `refunded` when the
/// provider's `charge.refunded` webhook arrives.
pub async fn refund_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<RefundResponse>, AppError> {
    let result = async {
        let invoice = state.ledger.get_invoice(invoice_id).await?;
        let payment_intent = invoice.payment_intent.ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "Invoice {} has no captured payment to refund",
                invoice_id
            ))
        })?;
        let refund_id = state.payments.refund_payment(&payment_intent).await?;
        tracing::info!(invoice_id = %invoice_id, refund_id = %refund_id, "Refund requested");
        Ok(RefundResponse {
            invoice_id,
            refund_id,
        })
    }
    .await
    .map_err(record_error)?;

    Ok(Json(result))
}
