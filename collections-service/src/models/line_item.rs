//! Line item and rate models for collections-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Round half away from zero to whole cents.
pub fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Staff booked on a request: `count` people of one position for a shift.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StaffLineItem {
    pub line_item_id: Uuid,
    pub request_id: Uuid,
    pub position: String,
    pub count: i32,
    pub hourly_rate: Decimal,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub shift_date: NaiveDate,
}

impl StaffLineItem {
    /// Shift length in hours. A shift ending before it starts counts as zero.
    pub fn hours(&self) -> Decimal {
        let minutes = (self.end_time - self.start_time).num_minutes().max(0);
        Decimal::from(minutes) / Decimal::from(60)
    }

    /// `hourly_rate × count × hours`, in cents. `None` when the product overflows.
    pub fn amount(&self) -> Option<Decimal> {
        let count = Decimal::from(self.count.max(0));
        self.hourly_rate
            .checked_mul(count)?
            .checked_mul(self.hours())
            .map(round_cents)
    }
}

/// Ad-hoc charge on a request (equipment, travel, parking...).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CustomLineItem {
    pub line_item_id: Uuid,
    pub request_id: Uuid,
    pub description: String,
    pub quantity: i32,
    pub rate: Decimal,
    pub total: Decimal,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl CustomLineItem {
    pub fn compute_total(quantity: i32, rate: Decimal) -> Option<Decimal> {
        Decimal::from(quantity).checked_mul(rate).map(round_cents)
    }
}

/// Largest unit rate accepted on a custom line item. With quantities capped at 10,000
/// every line total fits a `NUMERIC(12,2)` column.
pub const MAX_RATE: Decimal = Decimal::from_parts(99_999_999, 0, 0, false, 2);

fn validate_rate(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ValidationError::new("negative_rate"));
    }
    if *value > MAX_RATE {
        return Err(ValidationError::new("rate_too_large"));
    }
    if value.normalize().scale() > 2 {
        return Err(ValidationError::new("rate_precision"));
    }
    Ok(())
}

/// Input for creating or updating a custom line item. Items without an id are new.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CustomLineItemInput {
    pub line_item_id: Option<Uuid>,
    #[validate(length(min = 1, max = 255))]
    pub description: String,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i32,
    #[validate(custom(function = "validate_rate"))]
    pub rate: Decimal,
}

impl CustomLineItemInput {
    /// Resolve into a persistable item owned by `request_id`, assigning an id if needed.
    pub fn into_item(
        self,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CustomLineItem, ValidationError> {
        let total = CustomLineItem::compute_total(self.quantity, self.rate)
            .ok_or_else(|| ValidationError::new("total_overflow"))?;

        Ok(CustomLineItem {
            line_item_id: self.line_item_id.unwrap_or_else(Uuid::new_v4),
            request_id,
            total,
            description: self.description,
            quantity: self.quantity,
            rate: self.rate,
            created_utc: now,
            updated_utc: now,
        })
    }
}

/// Hourly rate for a staff type at a branch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Rate {
    pub rate_id: Uuid,
    pub staff_type: String,
    pub branch_id: Uuid,
    pub hourly_rate: Decimal,
}

/// Priced totals for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal: Decimal,
    pub transaction_fee: Decimal,
    pub service_fee: Decimal,
    pub total: Decimal,
}
