//! Payment provider webhook endpoint.

use super::record_error;
use crate::services::WebhookOutcome;
use crate::startup::AppState;
use axum::{extract::State, http::HeaderMap, Json};
use service_core::error::AppError;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /webhooks/stripe
///
/// The raw body is needed for signature verification, so it is taken as a string.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookOutcome>, AppError> {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state
        .reconciler
        .handle(&body, signature)
        .await
        .map_err(record_error)?;

    tracing::info!(outcome = ?outcome, "Stripe webhook processed");
    Ok(Json(outcome))
}
