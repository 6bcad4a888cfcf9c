//! Collections Service - pricing, invoicing, payment reconciliation and follow-ups
//! for event staffing requests.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
