//! Nightly bulk fan-out of per-user check-in reminders and timeouts.
//!
//! Users are grouped by their literal remind-at string; each bucket becomes
//! at most one delayed reminder message and one delayed timeout message
//! sharing the run's batch id. Per-user scheduling marks in the cache plus
//! the existing-task filter in the database keep reruns and replica races
//! from double-dispatching.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tokio::task::JoinSet;

use crate::broker::{EXCHANGE_DELAYED, QUEUE_CHECK_IN_REMINDER, QUEUE_CHECK_IN_TIMEOUT};
use crate::cache::ScheduleKind;
use crate::db::models::User;
use crate::db::repository::{NotificationTaskRepository, UserRepository};
use crate::error::{AppError, AppResult};
use crate::messages::{
    CheckInReminderMessage, CheckInTimeoutMessage, NotificationCategory, UserSettingSnapshot,
};
use crate::AppState;

pub struct DailyScheduler {
    state: Arc<AppState>,
    running: AtomicBool,
}

impl DailyScheduler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            running: AtomicBool::new(false),
        }
    }

    /// One full fan-out run. Refuses to overlap with an in-flight run in the
    /// same process and aborts past the configured deadline; either way the
    /// next tick retries whatever was left unmarked.
    pub async fn run(&self) -> AppResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Daily scheduler run already in progress; skipping");
            return Ok(());
        }

        let deadline = Duration::from_secs(self.state.config.scheduler.daily_run_timeout_seconds);
        let result = tokio::time::timeout(deadline, self.run_inner()).await;
        self.running.store(false, Ordering::SeqCst);

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Internal(anyhow::anyhow!(
                "daily scheduler run exceeded its {deadline:?} deadline"
            ))),
        }
    }

    async fn run_inner(&self) -> AppResult<()> {
        let batch_id = self.state.ids.next_batch_id();
        let date = Local::now().date_naive();

        let users = UserRepository::list_check_in_enabled(&self.state.db).await?;
        tracing::info!(batch_id, %date, users = users.len(), "Daily scheduler run started");
        if users.is_empty() {
            return Ok(());
        }

        let buckets = bucket_by_remind_at(users, &self.state.config.scheduler.default_remind_at);

        let mut join = JoinSet::new();
        for (remind_at, bucket) in buckets {
            if self.bucket_fully_scheduled(date, &bucket).await {
                tracing::debug!(remind_at, "Bucket already scheduled; skipping");
                continue;
            }
            let state = self.state.clone();
            join.spawn(async move { schedule_bucket(state, date, batch_id, remind_at, bucket).await });
        }

        let mut failures = 0usize;
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::error!("Bucket scheduling failed: {e}");
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!("Bucket task panicked: {e}");
                }
            }
        }

        if failures > 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "{failures} bucket(s) failed this run; unset scheduling marks retry next run"
            )));
        }
        tracing::info!(batch_id, "Daily scheduler run finished");
        Ok(())
    }

    /// True when every user in the bucket carries both scheduling marks.
    /// Cache misses and cache errors both count as "not scheduled": the
    /// database-side task filter downstream stays the backstop.
    async fn bucket_fully_scheduled(&self, date: NaiveDate, bucket: &[User]) -> bool {
        for user in bucket {
            let scheduled = self
                .state
                .cache
                .is_scheduled(ScheduleKind::CheckIn, date, user.id)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(user_id = user.id, "Scheduling-mark read failed: {e}");
                    false
                });
            if !scheduled {
                return false;
            }
        }
        true
    }
}

async fn schedule_bucket(
    state: Arc<AppState>,
    date: NaiveDate,
    batch_id: i64,
    remind_at: String,
    users: Vec<User>,
) -> AppResult<()> {
    let user_ids: Vec<i64> = users.iter().map(|u| u.id).collect();

    // Cross-check against tasks already materialized for today. This also
    // covers the case where the cache was flushed after a partial run.
    let existing: HashSet<i64> = NotificationTaskRepository::list_user_ids_with_tasks(
        &state.db,
        date,
        &[
            NotificationCategory::CheckinReminder.as_str(),
            NotificationCategory::CheckinTimeout.as_str(),
        ],
        &user_ids,
    )
    .await?
    .into_iter()
    .collect();

    let survivors: Vec<&User> = users.iter().filter(|u| !existing.contains(&u.id)).collect();
    if survivors.is_empty() {
        tracing::debug!(remind_at, "All users in bucket already have tasks today");
        return Ok(());
    }

    let now = Local::now().naive_local();
    let dev = state.config.environment.is_development();
    let remind_time = parse_time_of_day(&remind_at)
        .or_else(|| parse_time_of_day(&state.config.scheduler.default_remind_at))
        .unwrap_or_else(|| NaiveTime::from_hms_opt(20, 0, 0).unwrap());
    let grace = survivors[0]
        .grace_until
        .as_deref()
        .and_then(parse_time_of_day);

    let Some(fire_at) = compute_reminder_fire(now, date, remind_time, grace, dev) else {
        tracing::info!(remind_at, "Remind time past and grace exhausted; bucket skipped today");
        return Ok(());
    };
    let delay_seconds = (fire_at - now).num_seconds().max(0);

    let survivor_ids: Vec<i64> = survivors.iter().map(|u| u.id).collect();
    let snapshots: HashMap<String, UserSettingSnapshot> = survivors
        .iter()
        .map(|u| (u.public_id.clone(), u.snapshot()))
        .collect();

    let reminder = CheckInReminderMessage {
        message_id: state.ids.next_message_id(),
        batch_id,
        check_in_date: date,
        scheduled_at: Utc::now(),
        user_ids: survivor_ids.clone(),
        user_settings: snapshots,
        delay_seconds,
    };
    state
        .broker
        .publish_delayed(
            EXCHANGE_DELAYED,
            QUEUE_CHECK_IN_REMINDER,
            delay_seconds * 1000,
            &reminder,
        )
        .await?;
    tracing::info!(
        remind_at,
        users = survivor_ids.len(),
        delay_seconds,
        "Reminder batch published"
    );

    let mark_ttl = state.config.cache.processed_ttl_seconds;
    for user_id in &survivor_ids {
        if let Err(e) = state
            .cache
            .mark_scheduled(ScheduleKind::Reminder, date, *user_id, mark_ttl)
            .await
        {
            tracing::warn!(user_id, "Failed to set reminder scheduling mark: {e}");
        }
    }

    // The bucket shares the first survivor's deadline; buckets are
    // homogeneous per day by construction.
    let deadline_time = survivors[0]
        .deadline
        .as_deref()
        .and_then(parse_time_of_day)
        .or_else(|| parse_time_of_day(&state.config.scheduler.default_deadline))
        .unwrap_or_else(|| NaiveTime::from_hms_opt(21, 0, 0).unwrap());
    let timeout_delay = (date.and_time(deadline_time) - now).num_seconds().max(0);

    let timeout = CheckInTimeoutMessage {
        message_id: state.ids.next_message_id(),
        batch_id,
        check_in_date: date,
        scheduled_at: Utc::now(),
        user_ids: survivor_ids.clone(),
        delay_seconds: timeout_delay,
    };
    match state
        .broker
        .publish_delayed(
            EXCHANGE_DELAYED,
            QUEUE_CHECK_IN_TIMEOUT,
            timeout_delay * 1000,
            &timeout,
        )
        .await
    {
        Ok(()) => {
            tracing::info!(
                remind_at,
                users = survivor_ids.len(),
                delay_seconds = timeout_delay,
                "Timeout batch published"
            );
            for user_id in &survivor_ids {
                if let Err(e) = state
                    .cache
                    .mark_scheduled(ScheduleKind::CheckIn, date, *user_id, mark_ttl)
                    .await
                {
                    tracing::warn!(user_id, "Failed to set timeout scheduling mark: {e}");
                }
            }
        }
        Err(e) => {
            // Not fatal for the run: the timeout mark stays unset and the
            // next daily run re-publishes for this bucket.
            tracing::error!(remind_at, "Timeout batch publish failed: {e}");
        }
    }

    Ok(())
}

/// Group users by their literal remind-at string. No timezone
/// normalization: all users are assumed to live in the server's local zone.
fn bucket_by_remind_at(users: Vec<User>, default_remind_at: &str) -> HashMap<String, Vec<User>> {
    let mut buckets: HashMap<String, Vec<User>> = HashMap::new();
    for user in users {
        let key = user
            .remind_at
            .clone()
            .unwrap_or_else(|| default_remind_at.to_string());
        buckets.entry(key).or_default().push(user);
    }
    buckets
}

fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

/// Where today's reminder should fire, or None when the bucket must be
/// skipped (remind time past and the grace window exhausted).
///
/// - still ahead of us: fire at the configured time;
/// - past, inside grace: fire now (development offsets by a minute so the
///   message is observable in the delayed queue);
/// - past, grace unset: fire tomorrow (development: one minute from now);
/// - past, grace exhausted: skip, no back-fill for today.
fn compute_reminder_fire(
    now: NaiveDateTime,
    date: NaiveDate,
    remind_at: NaiveTime,
    grace_until: Option<NaiveTime>,
    development: bool,
) -> Option<NaiveDateTime> {
    let fire_at = date.and_time(remind_at);
    if fire_at > now {
        return Some(fire_at);
    }

    match grace_until {
        Some(grace) => {
            if now.time() < grace {
                if development {
                    Some(now + chrono::Duration::minutes(1))
                } else {
                    Some(now)
                }
            } else {
                None
            }
        }
        None => {
            if development {
                Some(now + chrono::Duration::minutes(1))
            } else {
                Some(fire_at + chrono::Duration::days(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn user(id: i64, remind_at: Option<&str>) -> User {
        let now = Utc::now().naive_utc();
        User {
            id,
            public_id: format!("u-{id}"),
            timezone: "Asia/Shanghai".to_string(),
            check_in_enabled: true,
            remind_at: remind_at.map(str::to_string),
            deadline: Some("21:00:00".to_string()),
            grace_until: None,
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn future_remind_time_fires_as_configured() {
        let fire = compute_reminder_fire(at(0, 5), date(), time(20, 0), None, false).unwrap();
        assert_eq!(fire, date().and_time(time(20, 0)));
        assert_eq!((fire - at(0, 5)).num_seconds(), 71_700);
    }

    #[test]
    fn past_remind_time_inside_grace_fires_immediately() {
        let now = at(20, 30);
        let fire = compute_reminder_fire(now, date(), time(20, 0), Some(time(21, 30)), false);
        assert_eq!(fire, Some(now));
    }

    #[test]
    fn past_remind_time_inside_grace_in_dev_offsets_a_minute() {
        let now = at(20, 30);
        let fire = compute_reminder_fire(now, date(), time(20, 0), Some(time(21, 30)), true);
        assert_eq!(fire, Some(now + chrono::Duration::minutes(1)));
    }

    #[test]
    fn grace_exhausted_skips_the_bucket() {
        let fire = compute_reminder_fire(at(22, 0), date(), time(20, 0), Some(time(21, 30)), false);
        assert_eq!(fire, None);
    }

    #[test]
    fn past_without_grace_rolls_to_tomorrow() {
        let fire = compute_reminder_fire(at(20, 30), date(), time(20, 0), None, false).unwrap();
        assert_eq!(
            fire,
            date().succ_opt().unwrap().and_time(time(20, 0))
        );
    }

    #[test]
    fn buckets_group_by_literal_remind_string() {
        let users = vec![
            user(1, Some("20:00:00")),
            user(2, Some("20:00:00")),
            user(3, Some("22:30:00")),
            user(4, None),
        ];
        let buckets = bucket_by_remind_at(users, "20:00:00");
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets["20:00:00"].len(), 3);
        assert_eq!(buckets["22:30:00"].len(), 1);
    }

    #[test]
    fn time_parsing_accepts_short_form() {
        assert_eq!(parse_time_of_day("20:00:00"), Some(time(20, 0)));
        assert_eq!(parse_time_of_day("20:00"), Some(time(20, 0)));
        assert_eq!(parse_time_of_day("not a time"), None);
    }
}
