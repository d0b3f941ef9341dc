//! Periodic journey scans.
//!
//! Delayed delivery only reaches 24 hours ahead, so journey timeouts cannot
//! be pre-enqueued at journey creation. Instead an approaching loop watches
//! for expected returns entering a short window and enqueues the timeout as
//! a delayed message, and an hourly compensation loop sweeps up anything
//! already overdue (service downtime, clock gaps, >24 h journeys).

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};

use crate::broker::{EXCHANGE_DELAYED, QUEUE_JOURNEY_TIMEOUT};
use crate::db::models::Journey;
use crate::db::repository::{JourneyRepository, UserRepository};
use crate::error::{AppError, AppResult};
use crate::messages::JourneyTimeoutMessage;
use crate::AppState;

pub struct JourneySweeper {
    state: Arc<AppState>,
}

impl JourneySweeper {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// One approaching-timeout tick: ongoing journeys whose expected return
    /// falls within the lookahead window get a delayed timeout message.
    /// Duplicate enqueues are harmless; the consumer's claim and the
    /// ongoing-status guard make processing idempotent.
    pub async fn run_approaching(&self) -> AppResult<()> {
        let deadline = Duration::from_secs(120);
        tokio::time::timeout(deadline, self.approaching_inner())
            .await
            .map_err(|_| {
                AppError::Internal(anyhow::anyhow!("approaching-timeout tick exceeded deadline"))
            })?
    }

    async fn approaching_inner(&self) -> AppResult<()> {
        let cfg = &self.state.config.scheduler;
        let now = Local::now().naive_local();
        let window_end = now + chrono::Duration::seconds(cfg.journey_window_seconds);

        let journeys = JourneyRepository::list_approaching(&self.state.db, now, window_end).await?;
        if journeys.is_empty() {
            return Ok(());
        }
        tracing::info!(count = journeys.len(), "Journeys approaching timeout");

        for journey in journeys {
            let fire_at = journey.expected_return_time
                + chrono::Duration::seconds(cfg.journey_grace_seconds);
            let delay_seconds = (fire_at - now)
                .num_seconds()
                .clamp(0, cfg.max_delay_seconds);
            self.publish_timeout(&journey, delay_seconds).await?;
        }
        Ok(())
    }

    /// One overdue-compensation tick: anything ongoing and already past its
    /// grace cutoff gets an immediate timeout message.
    pub async fn run_overdue(&self) -> AppResult<()> {
        let deadline = Duration::from_secs(300);
        tokio::time::timeout(deadline, self.overdue_inner())
            .await
            .map_err(|_| {
                AppError::Internal(anyhow::anyhow!("overdue-compensation tick exceeded deadline"))
            })?
    }

    async fn overdue_inner(&self) -> AppResult<()> {
        let cfg = &self.state.config.scheduler;
        let now = Local::now().naive_local();
        let cutoff = now - chrono::Duration::seconds(cfg.journey_grace_seconds);

        let journeys = JourneyRepository::list_overdue(&self.state.db, cutoff).await?;
        if journeys.is_empty() {
            return Ok(());
        }
        tracing::info!(count = journeys.len(), "Overdue journeys found by compensation sweep");

        for journey in journeys {
            self.publish_timeout(&journey, 0).await?;
        }
        Ok(())
    }

    async fn publish_timeout(&self, journey: &Journey, delay_seconds: i64) -> AppResult<()> {
        let user = match UserRepository::find_by_id(&self.state.db, journey.user_id).await? {
            Some(user) => user,
            None => {
                tracing::warn!(journey_id = journey.id, "Journey owner missing; skipping");
                return Ok(());
            }
        };

        let msg = JourneyTimeoutMessage {
            message_id: self.state.ids.next_message_id(),
            scheduled_at: Utc::now(),
            journey_id: journey.id,
            user_id: user.public_id,
            delay_seconds,
        };
        self.state
            .broker
            .publish_delayed(
                EXCHANGE_DELAYED,
                QUEUE_JOURNEY_TIMEOUT,
                delay_seconds * 1000,
                &msg,
            )
            .await?;
        tracing::debug!(
            journey_id = journey.id,
            delay_seconds,
            "Journey timeout enqueued"
        );
        Ok(())
    }
}
