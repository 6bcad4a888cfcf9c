//! Due-queue for scheduled emails.
//!
//! Each email is stored as a JSON blob under `scheduled_email:{id}` with a TTL, and
//! its id sits in the `scheduled_emails` sorted set scored by `send_at` (unix seconds).

use crate::models::ScheduledEmail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, Client};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

pub const SCHEDULE_SET_KEY: &str = "scheduled_emails";

pub fn blob_key(email_id: Uuid) -> String {
    format!("scheduled_email:{}", email_id)
}

#[async_trait]
pub trait DueQueue: Send + Sync {
    /// Store the blob, then add it to the schedule.
    async fn enqueue(&self, email: &ScheduledEmail, ttl_seconds: i64) -> Result<(), anyhow::Error>;
    /// Ids whose score is at or before `now`, oldest first.
    async fn due_ids(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, anyhow::Error>;
    async fn load(&self, email_id: Uuid) -> Result<Option<ScheduledEmail>, anyhow::Error>;
    /// Drop the schedule entry and the blob.
    async fn remove(&self, email_id: Uuid) -> Result<(), anyhow::Error>;
    /// Drop only the schedule entry (the blob is already gone).
    async fn unschedule(&self, email_id: Uuid) -> Result<(), anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisDueQueue {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisDueQueue {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.expose_secret().as_str())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl DueQueue for RedisDueQueue {
    async fn enqueue(&self, email: &ScheduledEmail, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let blob = serde_json::to_string(email)?;

        redis::cmd("SET")
            .arg(blob_key(email.email_id))
            .arg(blob)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to store scheduled email: {}", e))?;

        redis::cmd("ZADD")
            .arg(SCHEDULE_SET_KEY)
            .arg(email.send_at.timestamp())
            .arg(email.email_id.to_string())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to schedule email: {}", e))
    }

    async fn due_ids(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, anyhow::Error> {
        let mut conn = self.manager.clone();

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(SCHEDULE_SET_KEY)
            .arg(0)
            .arg(now.timestamp())
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read due emails: {}", e))?;

        Ok(members
            .iter()
            .filter_map(|member| match Uuid::parse_str(member) {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(member = %member, "Ignoring malformed schedule entry");
                    None
                }
            })
            .collect())
    }

    async fn load(&self, email_id: Uuid) -> Result<Option<ScheduledEmail>, anyhow::Error> {
        let mut conn = self.manager.clone();

        let blob: Option<String> = redis::cmd("GET")
            .arg(blob_key(email_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load scheduled email: {}", e))?;

        match blob {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, email_id: Uuid) -> Result<(), anyhow::Error> {
        self.unschedule(email_id).await?;

        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(blob_key(email_id))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete scheduled email: {}", e))
    }

    async fn unschedule(&self, email_id: Uuid) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("ZREM")
            .arg(SCHEDULE_SET_KEY)
            .arg(email_id.to_string())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to unschedule email: {}", e))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// In-memory due-queue for tests. Blobs are kept serialized, as Redis would.
#[derive(Default)]
pub struct MockDueQueue {
    pub schedule: Mutex<HashMap<Uuid, i64>>,
    pub blobs: Mutex<HashMap<Uuid, String>>,
}

impl MockDueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled_count(&self) -> usize {
        self.schedule.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Simulate TTL expiry of a blob while its schedule entry remains.
    pub fn expire_blob(&self, email_id: Uuid) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.remove(&email_id);
        }
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("Mock due-queue mutex poisoned")
}

#[async_trait]
impl DueQueue for MockDueQueue {
    async fn enqueue(&self, email: &ScheduledEmail, _ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let blob = serde_json::to_string(email)?;
        self.blobs
            .lock()
            .map_err(poisoned)?
            .insert(email.email_id, blob);
        self.schedule
            .lock()
            .map_err(poisoned)?
            .insert(email.email_id, email.send_at.timestamp());
        Ok(())
    }

    async fn due_ids(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, anyhow::Error> {
        let schedule = self.schedule.lock().map_err(poisoned)?;
        let mut due: Vec<(i64, Uuid)> = schedule
            .iter()
            .filter(|(_, score)| **score <= now.timestamp())
            .map(|(id, score)| (*score, *id))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn load(&self, email_id: Uuid) -> Result<Option<ScheduledEmail>, anyhow::Error> {
        let blobs = self.blobs.lock().map_err(poisoned)?;
        match blobs.get(&email_id) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, email_id: Uuid) -> Result<(), anyhow::Error> {
        self.unschedule(email_id).await?;
        self.blobs.lock().map_err(poisoned)?.remove(&email_id);
        Ok(())
    }

    async fn unschedule(&self, email_id: Uuid) -> Result<(), anyhow::Error> {
        self.schedule.lock().map_err(poisoned)?.remove(&email_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn email(send_at: DateTime<Utc>) -> ScheduledEmail {
        let now = Utc::now();
        ScheduledEmail {
            email_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            subject: "Reminder".to_string(),
            content: "<p>hello</p>".to_string(),
            reply_to: "support@example.com".to_string(),
            cc: vec![],
            bcc: vec![],
            send_at,
            created_utc: now,
            updated_utc: now,
        }
    }

    #[test]
    fn test_blob_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            blob_key(id),
            "scheduled_email:00000000-0000-0000-0000-000000000000"
        );
    }

    #[tokio::test]
    async fn test_mock_returns_only_due_entries_in_order() {
        let queue = MockDueQueue::new();
        let now = Utc::now();
        let later = email(now - Duration::minutes(1));
        let earlier = email(now - Duration::hours(1));
        let future = email(now + Duration::hours(1));
        for e in [&later, &earlier, &future] {
            queue.enqueue(e, 3600).await.unwrap();
        }

        let due = queue.due_ids(now).await.unwrap();
        assert_eq!(due, vec![earlier.email_id, later.email_id]);

        queue.remove(earlier.email_id).await.unwrap();
        assert_eq!(queue.scheduled_count(), 2);
        assert_eq!(queue.blob_count(), 2);
        assert!(queue.load(earlier.email_id).await.unwrap().is_none());
        assert_eq!(queue.load(later.email_id).await.unwrap(), Some(later));
    }
}
