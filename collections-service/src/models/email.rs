//! Scheduled email model for collections-service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Optional overrides for an outgoing email.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailHeaders {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// A rendered email waiting in the due-queue until `send_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEmail {
    pub email_id: Uuid,
    pub request_id: Uuid,
    pub subject: String,
    pub content: String,
    pub reply_to: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub send_at: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Binary attachment (e.g. an invoice PDF).
#[derive(Debug, Clone, PartialEq)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}
