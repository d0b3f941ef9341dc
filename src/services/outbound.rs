//! Outbound worker: the last hop before the SMS provider.
//!
//! The worker owns the end-to-end at-most-once guarantee. Three layers
//! stack up: the message claim (broker redeliveries), the task's
//! pending -> processing transition (replicated workers), and the provider
//! invoked only after both. Quota is debited before the send; an exhausted
//! quota fails the task without retry and raises a once-per-day event.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, Utc};
use serde_json::json;

use crate::broker::{EVENT_KEY_QUOTA_DEPLETED, EXCHANGE_EVENTS};
use crate::db::models::{ATTEMPT_STATE_FAILED, ATTEMPT_STATE_SENT};
use crate::db::repository::{
    ContactAttemptRepository, DailyCheckInRepository, NotificationTaskRepository,
    SmsQuotaRepository, UserRepository,
};
use crate::error::{AppError, AppResult, ConsumeError};
use crate::messages::{EventMessage, NotificationCategory, NotificationMessage, Payload};
use crate::services::with_claim;
use crate::AppState;

/// Capability for the concrete SMS provider. The production adapter lives
/// outside this crate; [`LogSender`] stands in for development and tests.
#[async_trait]
pub trait OutboundSender: Send + Sync + 'static {
    /// Deliver one SMS. An empty `phone_hash` means self-directed: the
    /// provider resolves the user's own number from the public id.
    async fn send_sms(
        &self,
        task_code: i64,
        user_id: &str,
        phone_hash: &str,
        payload: &Payload,
    ) -> AppResult<()>;
}

/// Development sender: logs the send and succeeds.
pub struct LogSender;

#[async_trait]
impl OutboundSender for LogSender {
    async fn send_sms(
        &self,
        task_code: i64,
        user_id: &str,
        phone_hash: &str,
        payload: &Payload,
    ) -> AppResult<()> {
        tracing::info!(
            task_code,
            user_id,
            phone_hash,
            payload = %serde_json::Value::Object(payload.clone()),
            "SMS send (log sender)"
        );
        Ok(())
    }
}

pub struct OutboundWorker {
    state: Arc<AppState>,
    sender: Arc<dyn OutboundSender>,
}

impl OutboundWorker {
    pub fn new(state: Arc<AppState>, sender: Arc<dyn OutboundSender>) -> Self {
        Self { state, sender }
    }

    pub async fn handle_message(&self, body: Vec<u8>) -> Result<(), ConsumeError> {
        let msg: NotificationMessage = serde_json::from_slice(&body)
            .map_err(|e| ConsumeError::bad_payload(format!("notification message: {e}")))?;

        let cache_cfg = &self.state.config.cache;
        with_claim(
            &self.state.cache,
            msg.message_id,
            cache_cfg.claim_ttl_seconds,
            cache_cfg.processed_ttl_seconds,
            || self.process(&msg),
        )
        .await
    }

    async fn process(&self, msg: &NotificationMessage) -> Result<(), ConsumeError> {
        let state = &self.state;
        if msg.task_code == 0 {
            return Err(ConsumeError::NonRetryable {
                code: "MISSING_TASK_CODE",
                reason: "notification message carries no task code".to_string(),
            });
        }

        let user = UserRepository::find_by_public_id(&state.db, &msg.user_id)
            .await?
            .ok_or(ConsumeError::Skip)?;

        // pending -> processing; the losing side of a race sees None.
        let task = match NotificationTaskRepository::claim_for_processing(&state.db, msg.task_code)
            .await?
        {
            Some(task) => task,
            None => {
                return match NotificationTaskRepository::find_by_task_code(&state.db, msg.task_code)
                    .await?
                {
                    Some(_) => Err(ConsumeError::Skip),
                    None => Err(ConsumeError::NonRetryable {
                        code: "UNKNOWN_TASK",
                        reason: format!("no task row for task code {}", msg.task_code),
                    }),
                };
            }
        };

        let today = Local::now().date_naive();
        let debited = SmsQuotaRepository::debit(
            &state.db,
            user.id,
            today,
            state.config.outbound.daily_quota,
        )
        .await?;
        if !debited {
            NotificationTaskRepository::mark_failed(&state.db, task.task_code).await?;
            ContactAttemptRepository::append(
                &state.db,
                task.id,
                user.id,
                &msg.phone_hash,
                ATTEMPT_STATE_FAILED,
                Some("quota_insufficient"),
            )
            .await?;
            self.publish_quota_depleted(&user.public_id, user.id).await;
            return Err(ConsumeError::QuotaInsufficient);
        }

        match self
            .sender
            .send_sms(msg.task_code, &msg.user_id, &msg.phone_hash, &msg.payload)
            .await
        {
            Ok(()) => {
                ContactAttemptRepository::append(
                    &state.db,
                    task.id,
                    user.id,
                    &msg.phone_hash,
                    ATTEMPT_STATE_SENT,
                    Some("ok"),
                )
                .await?;
                NotificationTaskRepository::mark_success(&state.db, task.task_code).await?;

                if msg.category == NotificationCategory::CheckinReminder {
                    if let Some(date) = msg.check_in_date {
                        DailyCheckInRepository::set_reminder_sent(
                            &state.db,
                            user.id,
                            date,
                            Utc::now().naive_utc(),
                        )
                        .await?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                ContactAttemptRepository::append(
                    &state.db,
                    task.id,
                    user.id,
                    &msg.phone_hash,
                    ATTEMPT_STATE_FAILED,
                    Some(&reason),
                )
                .await?;
                // Release the task so the redelivered message can claim it.
                NotificationTaskRepository::release_to_pending(&state.db, task.task_code).await?;
                tracing::warn!(task_code = msg.task_code, "Provider send failed: {reason}");
                Err(ConsumeError::Retryable(AppError::Provider(reason)))
            }
        }
    }

    /// Emit quota.depleted at most once per user per day.
    async fn publish_quota_depleted(&self, public_id: &str, user_id: i64) {
        let state = &self.state;
        let today = Local::now().date_naive();
        let claimed = state
            .cache
            .try_claim_quota_event(today, user_id, state.config.cache.processed_ttl_seconds)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id, "Quota event dedup check failed: {e}");
                false
            });
        if !claimed {
            return;
        }

        let mut payload = Payload::new();
        payload.insert("userId".to_string(), json!(public_id));
        payload.insert("date".to_string(), json!(today));
        let event = EventMessage {
            event_key: EVENT_KEY_QUOTA_DEPLETED.to_string(),
            event_type: EVENT_KEY_QUOTA_DEPLETED.to_string(),
            occurred_at: Utc::now(),
            payload,
        };
        if let Err(e) = state
            .broker
            .publish(EXCHANGE_EVENTS, EVENT_KEY_QUOTA_DEPLETED, &event)
            .await
        {
            tracing::warn!(user_id, "Failed to publish quota event: {e}");
        }
    }
}
