use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const TASK_STATUS_PENDING: &str = "pending";
pub const TASK_STATUS_PROCESSING: &str = "processing";
pub const TASK_STATUS_SUCCESS: &str = "success";
pub const TASK_STATUS_FAILED: &str = "failed";

/// A materialized notification awaiting outbound delivery.
///
/// `task_code` is the end-to-end idempotency key: the outbound provider is
/// invoked at most once per code, no matter how often the broker redelivers
/// the surrounding messages.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationTask {
    pub id: i64,

    /// Unique dedup key minted by the id generator.
    pub task_code: i64,

    pub user_id: i64,

    /// 'checkin_reminder', 'checkin_timeout', 'journey_reminder',
    /// 'journey_timeout' or 'quota_depleted'.
    pub category: String,

    /// Outbound channel, currently always 'sms'.
    pub channel: String,

    /// None for self-directed notifications (the user's own phone).
    pub contact_phone_hash: Option<String>,

    /// JSON-serialized opaque payload for the outbound channel.
    pub payload: String,

    /// 'pending', 'processing', 'success' or 'failed'.
    pub status: String,

    /// The day this task belongs to, used by the per-day dedup indexes.
    pub task_date: NaiveDate,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Data required to create a task. Creation is duplicate-tolerant: inserts
/// that collide with the per-day uniqueness indexes are silently dropped.
#[derive(Debug, Clone)]
pub struct CreateNotificationTask {
    pub task_code: i64,
    pub user_id: i64,
    pub category: String,
    pub channel: String,
    pub contact_phone_hash: Option<String>,
    pub payload: String,
    pub task_date: NaiveDate,
}
