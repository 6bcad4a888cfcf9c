//! Rate lookup and fee calculation for staffing requests.

use crate::models::{
    round_cents, CustomLineItem, CustomLineItemInput, PriceBreakdown, Rate, StaffLineItem,
};
use crate::services::repository::RequestRepository;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Card processing fee applied to the subtotal.
pub const TRANSACTION_FEE_RATE: Decimal = Decimal::from_parts(35, 0, 0, false, 3);

/// Service fee applied to the subtotal plus the transaction fee.
pub const SERVICE_FEE_RATE: Decimal = Decimal::from_parts(30, 0, 0, false, 2);

/// Price a set of line items.
///
/// Amounts too large for the money type are rejected rather than wrapped.
pub fn price(
    staff_items: &[StaffLineItem],
    custom_items: &[CustomLineItem],
) -> Result<PriceBreakdown, AppError> {
    let staff_total = staff_items
        .iter()
        .map(StaffLineItem::amount)
        .try_fold(Decimal::ZERO, |acc, amount| acc.checked_add(amount?));
    let subtotal = staff_total
        .and_then(|staff| {
            custom_items
                .iter()
                .try_fold(staff, |acc, item| acc.checked_add(item.total))
        })
        .ok_or_else(overflow)?;

    let transaction_fee = round_cents(subtotal * TRANSACTION_FEE_RATE);
    let service_fee = subtotal
        .checked_add(transaction_fee)
        .map(|base| round_cents(base * SERVICE_FEE_RATE))
        .ok_or_else(overflow)?;
    let total = subtotal
        .checked_add(transaction_fee)
        .and_then(|sum| sum.checked_add(service_fee))
        .ok_or_else(overflow)?;

    Ok(PriceBreakdown {
        subtotal,
        transaction_fee,
        service_fee,
        total,
    })
}

fn overflow() -> AppError {
    AppError::BadRequest(anyhow::anyhow!("line item amounts are too large to price"))
}

/// Line items of a request together with their priced totals.
#[derive(Debug, Clone, Serialize)]
pub struct RateSheet {
    pub request_id: Uuid,
    pub staff_line_items: Vec<StaffLineItem>,
    pub custom_line_items: Vec<CustomLineItem>,
    #[serde(flatten)]
    pub breakdown: PriceBreakdown,
}

#[derive(Clone)]
pub struct PricingEngine {
    requests: Arc<dyn RequestRepository>,
}

impl PricingEngine {
    pub fn new(requests: Arc<dyn RequestRepository>) -> Self {
        Self { requests }
    }

    /// Price the stored line items of a request without persisting anything.
    #[instrument(skip(self))]
    pub async fn calculate_rates(&self, request_id: Uuid) -> Result<PriceBreakdown, AppError> {
        Ok(self.get_rates(request_id).await?.breakdown)
    }

    #[instrument(skip(self))]
    pub async fn get_rates(&self, request_id: Uuid) -> Result<RateSheet, AppError> {
        self.ensure_request(request_id).await?;
        self.rate_sheet(request_id).await
    }

    /// Upsert custom line items and price the request with everything it now has.
    #[instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn update_rates(
        &self,
        request_id: Uuid,
        items: Vec<CustomLineItemInput>,
    ) -> Result<RateSheet, AppError> {
        self.ensure_request(request_id).await?;

        for item in &items {
            item.validate()?;
        }

        let now = Utc::now();
        for input in items {
            let item = input.into_item(request_id, now).map_err(|e| {
                AppError::BadRequest(anyhow::anyhow!("invalid custom line item: {}", e))
            })?;
            self.requests.upsert_custom_line_item(&item).await?;
        }

        let sheet = self.rate_sheet(request_id).await?;
        info!(
            request_id = %request_id,
            subtotal = %sheet.breakdown.subtotal,
            total = %sheet.breakdown.total,
            "Rates updated"
        );
        Ok(sheet)
    }

    /// Hourly rate for a staff type, preferring the branch's own rate.
    #[instrument(skip(self))]
    pub async fn rate_for(&self, staff_type: &str, branch_id: Uuid) -> Result<Rate, AppError> {
        if let Some(rate) = self.requests.find_branch_rate(staff_type, branch_id).await? {
            return Ok(rate);
        }

        match self.requests.find_any_branch_rate(staff_type).await? {
            Some(rate) => {
                warn!(
                    staff_type = %staff_type,
                    branch_id = %branch_id,
                    fallback_branch = %rate.branch_id,
                    "No branch rate; using another branch's rate"
                );
                Ok(rate)
            }
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "no rate found for staff type {} in branch {}",
                staff_type,
                branch_id
            ))),
        }
    }

    /// Build a staff line item priced at the branch rate for its position.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self))]
    pub async fn price_staff_item(
        &self,
        request_id: Uuid,
        branch_id: Uuid,
        position: &str,
        count: i32,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        shift_date: NaiveDate,
    ) -> Result<StaffLineItem, AppError> {
        let rate = self.rate_for(position, branch_id).await?;
        Ok(StaffLineItem {
            line_item_id: Uuid::new_v4(),
            request_id,
            position: position.to_string(),
            count,
            hourly_rate: rate.hourly_rate,
            start_time,
            end_time,
            shift_date,
        })
    }

    async fn ensure_request(&self, request_id: Uuid) -> Result<(), AppError> {
        match self.requests.get_request(request_id).await? {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Request {} not found",
                request_id
            ))),
        }
    }

    async fn rate_sheet(&self, request_id: Uuid) -> Result<RateSheet, AppError> {
        let staff_line_items = self.requests.list_staff_line_items(request_id).await?;
        let custom_line_items = self.requests.list_custom_line_items(request_id).await?;
        let breakdown = price(&staff_line_items, &custom_line_items)?;

        Ok(RateSheet {
            request_id,
            staff_line_items,
            custom_line_items,
            breakdown,
        })
    }
}
