use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const CHECK_IN_STATUS_PENDING: &str = "pending";
pub const CHECK_IN_STATUS_COMPLETED: &str = "completed";
pub const CHECK_IN_STATUS_MISSED: &str = "missed";

/// One user's check-in record for one day. Upserted when a reminder is
/// dispatched; transitioned by user action or by the timeout pipeline.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DailyCheckIn {
    pub id: i64,
    pub user_id: i64,
    pub check_in_date: NaiveDate,

    /// 'pending', 'completed' or 'missed'.
    pub status: String,

    pub reminder_sent_at: Option<NaiveDateTime>,
    pub alert_triggered_at: Option<NaiveDateTime>,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
