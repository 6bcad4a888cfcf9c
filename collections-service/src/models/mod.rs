//! Domain models for collections-service.

mod email;
mod invoice;
mod line_item;
mod request;

pub use email::{EmailAttachment, EmailHeaders, ScheduledEmail};
pub use invoice::{
    default_po_number, Invoice, InvoiceStatus, UpdateInvoice, DEFAULT_PAYMENT_TERMS,
    PAID_THRESHOLD,
};
pub use line_item::{
    round_cents, CustomLineItem, CustomLineItemInput, PriceBreakdown, Rate, StaffLineItem,
    MAX_RATE,
};
pub use request::StaffingRequest;
