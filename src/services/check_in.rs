//! Check-in consumers: the delayed reminder batch and the delayed timeout
//! batch.
//!
//! Both run the same skeleton: claim the message id, reconcile the payload
//! against live state, write tasks transactionally, then emit outbound
//! messages. The outbound message id is the task code, so redeliveries
//! collapse downstream no matter where a previous attempt stopped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::broker::{sms_routing_key, EVENT_KEY_CHECK_IN_TIMEOUT, EXCHANGE_EVENTS, EXCHANGE_NOTIFICATION};
use crate::db::models::{
    CreateNotificationTask, EmergencyContact, User, ATTEMPT_STATE_QUEUED,
};
use crate::db::repository::{
    ContactAttemptRepository, DailyCheckInRepository, EmergencyContactRepository,
    NotificationTaskRepository, UserRepository,
};
use crate::error::{AppError, ConsumeError};
use crate::messages::{
    Channel, CheckInReminderMessage, CheckInTimeoutMessage, EventMessage, NotificationCategory,
    NotificationMessage, Payload, UserSettingSnapshot,
};
use crate::services::with_claim;
use crate::AppState;

/// How a snapshotted user relates to their live settings at delivery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotClass {
    /// Settings unchanged; process in this batch.
    ProcessNow,
    /// Settings drifted since scan time. No action here: the write path
    /// already re-published a reminder on the new schedule.
    Republish,
    /// User deactivated or check-in disabled; drop silently.
    Skipped,
}

fn classify_user(snapshot: &UserSettingSnapshot, user: Option<&User>) -> SnapshotClass {
    let Some(user) = user else {
        return SnapshotClass::Skipped;
    };
    if !user.check_in_enabled || !user.is_active() {
        return SnapshotClass::Skipped;
    }
    if user.snapshot() != *snapshot {
        return SnapshotClass::Republish;
    }
    SnapshotClass::ProcessNow
}

pub struct CheckInService {
    state: Arc<AppState>,
}

impl CheckInService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn handle_reminder(&self, body: Vec<u8>) -> Result<(), ConsumeError> {
        let msg: CheckInReminderMessage = serde_json::from_slice(&body)
            .map_err(|e| ConsumeError::bad_payload(format!("reminder message: {e}")))?;

        let cache_cfg = &self.state.config.cache;
        with_claim(
            &self.state.cache,
            msg.message_id,
            cache_cfg.claim_ttl_seconds,
            cache_cfg.processed_ttl_seconds,
            || self.process_reminder(&msg),
        )
        .await
    }

    async fn process_reminder(&self, msg: &CheckInReminderMessage) -> Result<(), ConsumeError> {
        let state = &self.state;
        let users = UserRepository::find_by_ids(&state.db, &msg.user_ids).await?;
        let by_public_id: HashMap<&str, &User> =
            users.iter().map(|u| (u.public_id.as_str(), u)).collect();

        let mut process_now: Vec<&User> = Vec::new();
        let mut republished = 0usize;
        let mut skipped = 0usize;
        for (public_id, snapshot) in &msg.user_settings {
            let user = by_public_id.get(public_id.as_str()).copied();
            match classify_user(snapshot, user) {
                SnapshotClass::ProcessNow => process_now.push(user.unwrap()),
                SnapshotClass::Republish => republished += 1,
                SnapshotClass::Skipped => skipped += 1,
            }
        }
        tracing::info!(
            batch_id = msg.batch_id,
            process_now = process_now.len(),
            republished,
            skipped,
            "Reminder batch validated"
        );
        if process_now.is_empty() {
            return Ok(());
        }

        let mut tx = state.db.begin().await.map_err(AppError::Database)?;
        let mut created = Vec::new();
        for user in &process_now {
            let mut payload = Payload::new();
            payload.insert("checkInDate".to_string(), json!(msg.check_in_date));

            let task = NotificationTaskRepository::create(
                &mut *tx,
                CreateNotificationTask {
                    task_code: state.ids.next_task_code(),
                    user_id: user.id,
                    category: NotificationCategory::CheckinReminder.as_str().to_string(),
                    channel: Channel::Sms.as_str().to_string(),
                    contact_phone_hash: None,
                    payload: serde_json::to_string(&payload).map_err(AppError::Serde)?,
                    task_date: msg.check_in_date,
                },
            )
            .await?;
            if let Some(task) = task {
                created.push(((*user).clone(), payload, task));
            }
        }
        tx.commit().await.map_err(AppError::Database)?;

        for (user, payload, task) in created {
            let notification = NotificationMessage {
                message_id: task.task_code,
                task_code: task.task_code,
                user_id: user.public_id.clone(),
                category: NotificationCategory::CheckinReminder,
                channel: Channel::Sms,
                phone_hash: String::new(),
                payload,
                check_in_date: Some(msg.check_in_date),
            };
            state
                .broker
                .publish(
                    EXCHANGE_NOTIFICATION,
                    &sms_routing_key(NotificationCategory::CheckinReminder.as_str()),
                    &notification,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn handle_timeout(&self, body: Vec<u8>) -> Result<(), ConsumeError> {
        let msg: CheckInTimeoutMessage = serde_json::from_slice(&body)
            .map_err(|e| ConsumeError::bad_payload(format!("timeout message: {e}")))?;

        let cache_cfg = &self.state.config.cache;
        with_claim(
            &self.state.cache,
            msg.message_id,
            cache_cfg.claim_ttl_seconds,
            cache_cfg.processed_ttl_seconds,
            || self.process_timeout(&msg),
        )
        .await
    }

    async fn process_timeout(&self, msg: &CheckInTimeoutMessage) -> Result<(), ConsumeError> {
        let state = &self.state;
        let users = UserRepository::find_by_ids(&state.db, &msg.user_ids).await?;
        if users.is_empty() {
            return Err(ConsumeError::Skip);
        }

        let mut contacts_by_user: HashMap<i64, Vec<EmergencyContact>> = HashMap::new();
        for user in &users {
            let contacts = EmergencyContactRepository::list_for_user(&state.db, user.id).await?;
            contacts_by_user.insert(user.id, contacts);
        }

        let now = Utc::now().naive_utc();
        let mut tx = state.db.begin().await.map_err(AppError::Database)?;
        let mut alerted: Vec<&User> = Vec::new();
        let mut created = Vec::new();

        // The only exclusion here is "already completed", enforced by the
        // guarded upsert: a user whose settings changed after scheduling
        // still gets escalated while their check-in is pending.
        for user in &users {
            let flipped = DailyCheckInRepository::mark_alert_triggered(
                &mut *tx,
                user.id,
                msg.check_in_date,
                now,
            )
            .await?;
            if !flipped {
                // Already completed today (or already alerted); nothing to do.
                continue;
            }
            alerted.push(user);

            // Escalate to every registered contact at once. An empty
            // contact list is a valid outcome: the check-in is marked
            // missed with no outbound fan-out.
            for contact in contacts_by_user.get(&user.id).into_iter().flatten() {
                let mut payload = Payload::new();
                payload.insert("checkInDate".to_string(), json!(msg.check_in_date));
                payload.insert("contactName".to_string(), json!(contact.display_name));
                payload.insert("priority".to_string(), json!(contact.priority));

                let task = NotificationTaskRepository::create(
                    &mut *tx,
                    CreateNotificationTask {
                        task_code: state.ids.next_task_code(),
                        user_id: user.id,
                        category: NotificationCategory::CheckinTimeout.as_str().to_string(),
                        channel: Channel::Sms.as_str().to_string(),
                        contact_phone_hash: Some(contact.phone_hash.clone()),
                        payload: serde_json::to_string(&payload).map_err(AppError::Serde)?,
                        task_date: msg.check_in_date,
                    },
                )
                .await?;
                if let Some(task) = task {
                    ContactAttemptRepository::append(
                        &mut *tx,
                        task.id,
                        user.id,
                        &contact.phone_hash,
                        ATTEMPT_STATE_QUEUED,
                        None,
                    )
                    .await?;
                    created.push((user.clone(), payload, task));
                }
            }
        }
        tx.commit().await.map_err(AppError::Database)?;

        if alerted.is_empty() {
            return Err(ConsumeError::Skip);
        }
        tracing::info!(
            batch_id = msg.batch_id,
            alerted = alerted.len(),
            tasks = created.len(),
            "Check-in timeouts processed"
        );

        for (user, payload, task) in &created {
            let notification = NotificationMessage {
                message_id: task.task_code,
                task_code: task.task_code,
                user_id: user.public_id.clone(),
                category: NotificationCategory::CheckinTimeout,
                channel: Channel::Sms,
                phone_hash: task.contact_phone_hash.clone().unwrap_or_default(),
                payload: payload.clone(),
                check_in_date: Some(msg.check_in_date),
            };
            state
                .broker
                .publish(
                    EXCHANGE_NOTIFICATION,
                    &sms_routing_key(NotificationCategory::CheckinTimeout.as_str()),
                    &notification,
                )
                .await?;
        }

        // Best-effort domain event; task state already committed, so a lost
        // event is not worth a requeue.
        for user in &alerted {
            let mut payload = Payload::new();
            payload.insert("userId".to_string(), json!(user.public_id));
            payload.insert("checkInDate".to_string(), json!(msg.check_in_date));
            let event = EventMessage {
                event_key: EVENT_KEY_CHECK_IN_TIMEOUT.to_string(),
                event_type: EVENT_KEY_CHECK_IN_TIMEOUT.to_string(),
                occurred_at: Utc::now(),
                payload,
            };
            if let Err(e) = state
                .broker
                .publish(EXCHANGE_EVENTS, EVENT_KEY_CHECK_IN_TIMEOUT, &event)
                .await
            {
                tracing::warn!(user_id = user.id, "Failed to publish timeout event: {e}");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot() -> UserSettingSnapshot {
        UserSettingSnapshot {
            remind_at: Some("20:00:00".to_string()),
            deadline: Some("21:00:00".to_string()),
            grace_until: None,
            timezone: "Asia/Shanghai".to_string(),
        }
    }

    fn user() -> User {
        let now = Utc::now().naive_utc();
        User {
            id: 1,
            public_id: "u-1".to_string(),
            timezone: "Asia/Shanghai".to_string(),
            check_in_enabled: true,
            remind_at: Some("20:00:00".to_string()),
            deadline: Some("21:00:00".to_string()),
            grace_until: None,
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn unchanged_settings_process_now() {
        assert_eq!(
            classify_user(&snapshot(), Some(&user())),
            SnapshotClass::ProcessNow
        );
    }

    #[test]
    fn drifted_settings_are_republished() {
        let mut changed = user();
        changed.remind_at = Some("22:00:00".to_string());
        assert_eq!(
            classify_user(&snapshot(), Some(&changed)),
            SnapshotClass::Republish
        );
    }

    #[test]
    fn disabled_or_missing_users_are_skipped() {
        let mut disabled = user();
        disabled.check_in_enabled = false;
        assert_eq!(
            classify_user(&snapshot(), Some(&disabled)),
            SnapshotClass::Skipped
        );

        let mut suspended = user();
        suspended.status = "suspended".to_string();
        assert_eq!(
            classify_user(&snapshot(), Some(&suspended)),
            SnapshotClass::Skipped
        );

        assert_eq!(classify_user(&snapshot(), None), SnapshotClass::Skipped);
    }
}
