use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const JOURNEY_STATUS_ONGOING: &str = "ongoing";
pub const JOURNEY_STATUS_RETURNED: &str = "returned";
pub const JOURNEY_STATUS_TIMEOUT_ALERTED: &str = "timeout_alerted";

/// A user-declared outing with an expected return time. Status only ever
/// moves forward: ongoing -> returned, or ongoing -> timeout_alerted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Journey {
    pub id: i64,
    pub user_id: i64,
    pub destination: String,
    pub expected_return_time: NaiveDateTime,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Journey {
    pub fn is_ongoing(&self) -> bool {
        self.status == JOURNEY_STATUS_ONGOING
    }
}
