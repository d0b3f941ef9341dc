use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::messages::UserSettingSnapshot;

pub const USER_STATUS_ACTIVE: &str = "active";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    /// Internal id, never leaves the service.
    pub id: i64,

    /// External stable id used in wire messages.
    pub public_id: String,

    pub timezone: String,

    /// Whether the daily check-in is enabled for this user.
    pub check_in_enabled: bool,

    /// Wall-clock times of day, HH:MM:SS.
    pub remind_at: Option<String>,
    pub deadline: Option<String>,
    pub grace_until: Option<String>,

    /// 'active', 'inactive' or 'suspended'.
    pub status: String,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == USER_STATUS_ACTIVE
    }

    /// Freeze the reminder settings for embedding into a reminder message.
    pub fn snapshot(&self) -> UserSettingSnapshot {
        UserSettingSnapshot {
            remind_at: self.remind_at.clone(),
            deadline: self.deadline.clone(),
            grace_until: self.grace_until.clone(),
            timezone: self.timezone.clone(),
        }
    }
}
