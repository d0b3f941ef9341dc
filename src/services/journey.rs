//! Journey consumers: the pre-return reminder and the overdue timeout.
//!
//! Timeout processing is the escalation path: the journey flips to
//! timeout_alerted exactly once (guarded UPDATE), and only the winning
//! delivery materializes contact tasks. Everything else is a skip.

use std::sync::Arc;

use chrono::{Local, Utc};
use serde_json::json;

use crate::broker::{sms_routing_key, EVENT_KEY_JOURNEY_TIMEOUT, EXCHANGE_EVENTS, EXCHANGE_NOTIFICATION};
use crate::db::models::{CreateNotificationTask, Journey, User, ATTEMPT_STATE_QUEUED};
use crate::db::repository::{
    ContactAttemptRepository, EmergencyContactRepository, JourneyRepository,
    NotificationTaskRepository, UserRepository,
};
use crate::error::{AppError, ConsumeError};
use crate::messages::{
    Channel, EventMessage, JourneyReminderMessage, JourneyTimeoutMessage, NotificationCategory,
    NotificationMessage, Payload,
};
use crate::services::with_claim;
use crate::AppState;

pub struct JourneyService {
    state: Arc<AppState>,
}

impl JourneyService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn handle_reminder(&self, body: Vec<u8>) -> Result<(), ConsumeError> {
        let msg: JourneyReminderMessage = serde_json::from_slice(&body)
            .map_err(|e| ConsumeError::bad_payload(format!("journey reminder: {e}")))?;

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

    async fn process_reminder(&self, msg: &JourneyReminderMessage) -> Result<(), ConsumeError> {
        let state = &self.state;
        let (journey, user) = self.load_journey_and_user(msg.journey_id, &msg.user_id).await?;
        if !journey.is_ongoing() {
            return Err(ConsumeError::Skip);
        }

        let mut payload = Payload::new();
        payload.insert("journeyId".to_string(), json!(journey.id));
        payload.insert("destination".to_string(), json!(journey.destination));
        payload.insert(
            "expectedReturnTime".to_string(),
            json!(journey.expected_return_time),
        );

        // One self-directed reminder per journey per day; a duplicate
        // delivery collides with the per-day index and creates nothing.
        let task = NotificationTaskRepository::create(
            &state.db,
            CreateNotificationTask {
                task_code: state.ids.next_task_code(),
                user_id: user.id,
                category: NotificationCategory::JourneyReminder.as_str().to_string(),
                channel: Channel::Sms.as_str().to_string(),
                contact_phone_hash: None,
                payload: serde_json::to_string(&payload).map_err(AppError::Serde)?,
                task_date: Local::now().date_naive(),
            },
        )
        .await?;

        if let Some(task) = task {
            let notification = NotificationMessage {
                message_id: task.task_code,
                task_code: task.task_code,
                user_id: user.public_id.clone(),
                category: NotificationCategory::JourneyReminder,
                channel: Channel::Sms,
                phone_hash: String::new(),
                payload,
                check_in_date: None,
            };
            state
                .broker
                .publish(
                    EXCHANGE_NOTIFICATION,
                    &sms_routing_key(NotificationCategory::JourneyReminder.as_str()),
                    &notification,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn handle_timeout(&self, body: Vec<u8>) -> Result<(), ConsumeError> {
        let msg: JourneyTimeoutMessage = serde_json::from_slice(&body)
            .map_err(|e| ConsumeError::bad_payload(format!("journey timeout: {e}")))?;

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

    async fn process_timeout(&self, msg: &JourneyTimeoutMessage) -> Result<(), ConsumeError> {
        let state = &self.state;
        let (journey, user) = self.load_journey_and_user(msg.journey_id, &msg.user_id).await?;
        if !journey.is_ongoing() {
            return Err(ConsumeError::Skip);
        }

        let contacts = EmergencyContactRepository::list_for_user(&state.db, user.id).await?;
        let task_date = Local::now().date_naive();

        let mut tx = state.db.begin().await.map_err(AppError::Database)?;
        let flipped = JourneyRepository::mark_timeout_alerted(&mut *tx, journey.id).await?;
        if !flipped {
            // Closed or alerted between our read and the update.
            tx.rollback().await.map_err(AppError::Database)?;
            return Err(ConsumeError::Skip);
        }

        let mut created = Vec::new();
        for contact in &contacts {
            let mut payload = Payload::new();
            payload.insert("journeyId".to_string(), json!(journey.id));
            payload.insert("destination".to_string(), json!(journey.destination));
            payload.insert(
                "expectedReturnTime".to_string(),
                json!(journey.expected_return_time),
            );
            payload.insert("contactName".to_string(), json!(contact.display_name));
            payload.insert("priority".to_string(), json!(contact.priority));

            let task = NotificationTaskRepository::create(
                &mut *tx,
                CreateNotificationTask {
                    task_code: state.ids.next_task_code(),
                    user_id: user.id,
                    category: NotificationCategory::JourneyTimeout.as_str().to_string(),
                    channel: Channel::Sms.as_str().to_string(),
                    contact_phone_hash: Some(contact.phone_hash.clone()),
                    payload: serde_json::to_string(&payload).map_err(AppError::Serde)?,
                    task_date,
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
                created.push((payload, task));
            }
        }
        tx.commit().await.map_err(AppError::Database)?;
        tracing::info!(
            journey_id = journey.id,
            tasks = created.len(),
            "Journey timeout alerted"
        );

        for (payload, task) in created {
            let notification = NotificationMessage {
                message_id: task.task_code,
                task_code: task.task_code,
                user_id: user.public_id.clone(),
                category: NotificationCategory::JourneyTimeout,
                channel: Channel::Sms,
                phone_hash: task.contact_phone_hash.clone().unwrap_or_default(),
                payload,
                check_in_date: None,
            };
            state
                .broker
                .publish(
                    EXCHANGE_NOTIFICATION,
                    &sms_routing_key(NotificationCategory::JourneyTimeout.as_str()),
                    &notification,
                )
                .await?;
        }

        let mut payload = Payload::new();
        payload.insert("userId".to_string(), json!(user.public_id));
        payload.insert("journeyId".to_string(), json!(journey.id));
        let event = EventMessage {
            event_key: EVENT_KEY_JOURNEY_TIMEOUT.to_string(),
            event_type: EVENT_KEY_JOURNEY_TIMEOUT.to_string(),
            occurred_at: Utc::now(),
            payload,
        };
        if let Err(e) = state
            .broker
            .publish(EXCHANGE_EVENTS, EVENT_KEY_JOURNEY_TIMEOUT, &event)
            .await
        {
            tracing::warn!(journey_id = journey.id, "Failed to publish journey event: {e}");
        }

        Ok(())
    }

    /// Resolve the journey and its owner, skipping obsolete references and
    /// flagging mismatched ones to the DLQ.
    async fn load_journey_and_user(
        &self,
        journey_id: i64,
        public_user_id: &str,
    ) -> Result<(Journey, User), ConsumeError> {
        let journey = JourneyRepository::find_by_id(&self.state.db, journey_id)
            .await?
            .ok_or(ConsumeError::Skip)?;

        let user = UserRepository::find_by_public_id(&self.state.db, public_user_id)
            .await?
            .ok_or(ConsumeError::Skip)?;

        if journey.user_id != user.id {
            return Err(ConsumeError::NonRetryable {
                code: "JOURNEY_USER_MISMATCH",
                reason: format!("journey {journey_id} does not belong to user {public_user_id}"),
            });
        }
        if !user.is_active() {
            return Err(ConsumeError::Skip);
        }
        Ok((journey, user))
    }
}
