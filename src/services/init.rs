//! Initialization helpers for the application:
//! - database connection + migrations
//! - background scheduling loops
//! - consumer spawn helpers
//!
//! This module centralizes bits that would otherwise live in `main.rs`.

use std::{path::Path, sync::Arc};

use anyhow::Result;
use chrono::{Local, NaiveDateTime};

use crate::broker::{
    QUEUE_CHECK_IN_REMINDER, QUEUE_CHECK_IN_TIMEOUT, QUEUE_JOURNEY_REMINDER,
    QUEUE_JOURNEY_TIMEOUT, QUEUE_NOTIFICATION_SMS,
};
use crate::config::Config;
use crate::services::check_in::CheckInService;
use crate::services::journey::JourneyService;
use crate::services::outbound::OutboundWorker;
use crate::services::scheduler::DailyScheduler;
use crate::services::sweeper::JourneySweeper;

/// Redact potentially sensitive information from a database URL before logging.
///
/// Attempts to parse the URL and remove userinfo (username:password) components.
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        let path = url.path();
        format!("{}://{}{}{}", scheme, host, port_part, path)
    } else if let Some(at_pos) = db_url.find('@') {
        let without_creds = &db_url[at_pos + 1..];
        format!("(redacted){}", without_creds)
    } else {
        "(redacted)".to_string()
    }
}

/// Initialize SQLite database connection and run migrations.
///
/// Creates the parent directory for the database file (if applicable),
/// opens a connection pool using `create_if_missing(true)` and runs
/// migrations.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Seconds until the next local 00:05, the daily fan-out time.
fn until_next_daily_run(now: NaiveDateTime) -> std::time::Duration {
    let today_run = now
        .date()
        .and_hms_opt(0, 5, 0)
        .expect("00:05 is a valid time");
    let next = if now < today_run {
        today_run
    } else {
        today_run + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or_default()
}

/// Spawn the three scheduling loops:
/// - daily check-in fan-out at local 00:05
/// - journey approaching-timeout sweep (short interval, short window)
/// - journey overdue compensation sweep (hourly)
///
/// Each worker listens for a shutdown notification via a
/// `tokio::sync::broadcast::Sender<()>` and exits between ticks.
pub fn spawn_background_workers(
    daily: Arc<DailyScheduler>,
    sweeper: Arc<JourneySweeper>,
    config: &Config,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // Daily check-in fan-out
    {
        let mut shutdown_rx = shutdown.subscribe();
        let daily = daily.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let wait = until_next_daily_run(Local::now().naive_local());
                tracing::info!("Next daily scheduling run in {}s", wait.as_secs());
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Daily scheduler loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                if let Err(e) = daily.run().await {
                    tracing::error!("Daily scheduling run failed: {e}");
                }
            }
        }));
    }

    // Journey approaching-timeout sweep
    {
        let mut shutdown_rx = shutdown.subscribe();
        let sweeper = sweeper.clone();
        let tick = std::time::Duration::from_secs(config.scheduler.journey_tick_seconds);
        handles.push(tokio::spawn(async move {
            loop {
                if let Err(e) = sweeper.run_approaching().await {
                    tracing::warn!("Approaching-timeout sweep failed: {e}");
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Approaching-timeout loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(tick) => {}
                }
            }
        }));
    }

    // Journey overdue compensation sweep
    {
        let mut shutdown_rx = shutdown.subscribe();
        let sweeper = sweeper.clone();
        let tick = std::time::Duration::from_secs(config.scheduler.journey_overdue_tick_seconds);
        handles.push(tokio::spawn(async move {
            loop {
                if let Err(e) = sweeper.run_overdue().await {
                    tracing::warn!("Overdue compensation sweep failed: {e}");
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Overdue compensation loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(tick) => {}
                }
            }
        }));
    }

    handles
}

/// Spawn one consumer task per queue. Each consumer opens its own channel
/// with the configured prefetch and drains until shutdown.
pub fn spawn_consumers(
    state: Arc<crate::AppState>,
    check_in: Arc<CheckInService>,
    journey: Arc<JourneyService>,
    outbound: Arc<OutboundWorker>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    let scheduler_prefetch = state.config.broker.scheduler_prefetch;
    let outbound_prefetch = state.config.broker.outbound_prefetch;

    {
        let state = state.clone();
        let svc = check_in.clone();
        let shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let result = state
                .broker
                .consume(
                    QUEUE_CHECK_IN_REMINDER,
                    "checkin-reminder-worker",
                    scheduler_prefetch,
                    shutdown_rx,
                    move |body| {
                        let svc = svc.clone();
                        async move { svc.handle_reminder(body).await }
                    },
                )
                .await;
            if let Err(e) = result {
                tracing::error!("Check-in reminder consumer terminated: {e}");
            }
        }));
    }

    {
        let state = state.clone();
        let svc = check_in.clone();
        let shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let result = state
                .broker
                .consume(
                    QUEUE_CHECK_IN_TIMEOUT,
                    "checkin-timeout-worker",
                    scheduler_prefetch,
                    shutdown_rx,
                    move |body| {
                        let svc = svc.clone();
                        async move { svc.handle_timeout(body).await }
                    },
                )
                .await;
            if let Err(e) = result {
                tracing::error!("Check-in timeout consumer terminated: {e}");
            }
        }));
    }

    {
        let state = state.clone();
        let svc = journey.clone();
        let shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let result = state
                .broker
                .consume(
                    QUEUE_JOURNEY_REMINDER,
                    "journey-reminder-worker",
                    scheduler_prefetch,
                    shutdown_rx,
                    move |body| {
                        let svc = svc.clone();
                        async move { svc.handle_reminder(body).await }
                    },
                )
                .await;
            if let Err(e) = result {
                tracing::error!("Journey reminder consumer terminated: {e}");
            }
        }));
    }

    {
        let state = state.clone();
        let svc = journey.clone();
        let shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let result = state
                .broker
                .consume(
                    QUEUE_JOURNEY_TIMEOUT,
                    "journey-timeout-worker",
                    scheduler_prefetch,
                    shutdown_rx,
                    move |body| {
                        let svc = svc.clone();
                        async move { svc.handle_timeout(body).await }
                    },
                )
                .await;
            if let Err(e) = result {
                tracing::error!("Journey timeout consumer terminated: {e}");
            }
        }));
    }

    {
        let state = state.clone();
        let svc = outbound.clone();
        let shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let result = state
                .broker
                .consume(
                    QUEUE_NOTIFICATION_SMS,
                    "outbound-sms-worker",
                    outbound_prefetch,
                    shutdown_rx,
                    move |body| {
                        let svc = svc.clone();
                        async move { svc.handle_message(body).await }
                    },
                )
                .await;
            if let Err(e) = result {
                tracing::error!("Outbound SMS consumer terminated: {e}");
            }
        }));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn daily_run_waits_until_five_past_midnight() {
        let just_after_midnight = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            until_next_daily_run(just_after_midnight).as_secs(),
            5 * 60
        );

        let midday = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(12, 5, 0)
            .unwrap();
        assert_eq!(until_next_daily_run(midday).as_secs(), 12 * 3600);
    }
}
