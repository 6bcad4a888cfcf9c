//! Staffing request model (owned by the request intake service, read here).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StaffingRequest {
    pub request_id: Uuid,
    pub branch_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub event_location: Option<String>,
    pub start_date: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl StaffingRequest {
    pub fn client_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}
