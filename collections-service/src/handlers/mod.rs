//! HTTP handlers for collections-service.

pub mod follow_ups;
pub mod health;
pub mod invoices;
pub mod rates;
pub mod webhooks;

use crate::services::metrics::ERRORS_TOTAL;
use service_core::error::AppError;

/// Count a failed request by error type before it is rendered.
pub(crate) fn record_error(err: AppError) -> AppError {
    ERRORS_TOTAL.with_label_values(&[err.error_type()]).inc();
    err
}
