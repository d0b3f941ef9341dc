//! Wire-level message envelopes.
//!
//! Everything published to or consumed from the broker is one of these
//! JSON bodies. Field names are camelCase on the wire to stay compatible
//! with the other services producing into the same topology.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Opaque payload forwarded untouched to the outbound channel.
pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    CheckinReminder,
    CheckinTimeout,
    JourneyReminder,
    JourneyTimeout,
    QuotaDepleted,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::CheckinReminder => "checkin_reminder",
            NotificationCategory::CheckinTimeout => "checkin_timeout",
            NotificationCategory::JourneyReminder => "journey_reminder",
            NotificationCategory::JourneyTimeout => "journey_timeout",
            NotificationCategory::QuotaDepleted => "quota_depleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
        }
    }
}

/// The user's reminder settings frozen at scan time. Consumers compare the
/// snapshot against live settings to detect drift between scheduling and
/// delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettingSnapshot {
    pub remind_at: Option<String>,
    pub deadline: Option<String>,
    pub grace_until: Option<String>,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInReminderMessage {
    pub message_id: i64,
    pub batch_id: i64,
    pub check_in_date: NaiveDate,
    pub scheduled_at: DateTime<Utc>,
    pub user_ids: Vec<i64>,
    /// Keyed by public user id.
    pub user_settings: HashMap<String, UserSettingSnapshot>,
    pub delay_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInTimeoutMessage {
    pub message_id: i64,
    pub batch_id: i64,
    pub check_in_date: NaiveDate,
    pub scheduled_at: DateTime<Utc>,
    pub user_ids: Vec<i64>,
    pub delay_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JourneyReminderMessage {
    pub message_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub journey_id: i64,
    /// Public user id.
    pub user_id: String,
    pub delay_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JourneyTimeoutMessage {
    pub message_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub journey_id: i64,
    pub user_id: String,
    pub delay_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub message_id: i64,
    pub task_code: i64,
    /// Public user id.
    pub user_id: String,
    pub category: NotificationCategory,
    pub channel: Channel,
    /// Empty for self-directed notifications.
    pub phone_hash: String,
    pub payload: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub event_key: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reminder_envelope_uses_camel_case_on_the_wire() {
        let mut settings = HashMap::new();
        settings.insert(
            "u-123".to_string(),
            UserSettingSnapshot {
                remind_at: Some("20:00:00".to_string()),
                deadline: Some("21:00:00".to_string()),
                grace_until: None,
                timezone: "Asia/Shanghai".to_string(),
            },
        );
        let msg = CheckInReminderMessage {
            message_id: 42,
            batch_id: 7,
            check_in_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            scheduled_at: Utc::now(),
            user_ids: vec![1, 2],
            user_settings: settings,
            delay_seconds: 71700,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"messageId\":42"));
        assert!(json.contains("\"batchId\":7"));
        assert!(json.contains("\"checkInDate\":\"2025-06-01\""));
        assert!(json.contains("\"delaySeconds\":71700"));
        assert!(json.contains("\"remindAt\":\"20:00:00\""));
    }

    #[test]
    fn categories_serialize_snake_case() {
        let json = serde_json::to_string(&NotificationCategory::CheckinTimeout).unwrap();
        assert_eq!(json, "\"checkin_timeout\"");
        assert_eq!(
            serde_json::from_str::<NotificationCategory>("\"journey_timeout\"").unwrap(),
            NotificationCategory::JourneyTimeout
        );
    }

    #[test]
    fn check_in_date_is_omitted_when_absent() {
        let msg = NotificationMessage {
            message_id: 1,
            task_code: 2,
            user_id: "u-1".to_string(),
            category: NotificationCategory::JourneyTimeout,
            channel: Channel::Sms,
            phone_hash: "abc".to_string(),
            payload: Payload::new(),
            check_in_date: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("checkInDate"));
    }
}
