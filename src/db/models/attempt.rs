use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const ATTEMPT_STATE_QUEUED: &str = "queued";
pub const ATTEMPT_STATE_SENT: &str = "sent";
pub const ATTEMPT_STATE_FAILED: &str = "failed";

/// Append-only log of outbound attempts. Never updated in place; each
/// provider invocation appends a new row carrying the provider result.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ContactAttempt {
    pub id: i64,
    pub task_id: i64,
    pub user_id: i64,
    pub phone_hash: String,
    pub state: String,
    pub provider_result: Option<String>,
    pub created_at: NaiveDateTime,
}
