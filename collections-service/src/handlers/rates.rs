//! Rate sheet handlers.

use super::invoices::LineItemsRequest;
use super::record_error;
use crate::services::RateSheet;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

/// GET /requests/:request_id/rates
pub async fn get_rates(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<RateSheet>, AppError> {
    let sheet = state
        .pricing
        .get_rates(request_id)
        .await
        .map_err(record_error)?;
    Ok(Json(sheet))
}

/// PUT /requests/:request_id/rates
pub async fn update_rates(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<LineItemsRequest>,
) -> Result<Json<RateSheet>, AppError> {
    let sheet = state
        .pricing
        .update_rates(request_id, body.items)
        .await
        .map_err(record_error)?;
    Ok(Json(sheet))
}
