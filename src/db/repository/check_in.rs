use chrono::{NaiveDate, NaiveDateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};

use crate::db::models::{DailyCheckIn, CHECK_IN_STATUS_MISSED, CHECK_IN_STATUS_PENDING};
use crate::error::{AppError, AppResult};

pub struct DailyCheckInRepository;

impl DailyCheckInRepository {
    #[allow(dead_code)]
    pub async fn find(
        pool: &SqlitePool,
        user_id: i64,
        date: NaiveDate,
    ) -> AppResult<Option<DailyCheckIn>> {
        let row = sqlx::query_as::<_, DailyCheckIn>(
            r#"
            SELECT
                id, user_id, check_in_date, status,
                reminder_sent_at, alert_triggered_at,
                created_at, updated_at
            FROM daily_check_ins
            WHERE user_id = ? AND check_in_date = ?
            "#,
        )
        .bind(user_id)
        .bind(date)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Record that the reminder went out. Last-writer-wins upsert on
    /// `(user_id, check_in_date)`; the row is created pending if the user
    /// had not checked in yet.
    pub async fn set_reminder_sent(
        pool: &SqlitePool,
        user_id: i64,
        date: NaiveDate,
        sent_at: NaiveDateTime,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            r#"
            INSERT INTO daily_check_ins (
                user_id, check_in_date, status, reminder_sent_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, check_in_date) DO UPDATE SET
                reminder_sent_at = excluded.reminder_sent_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(CHECK_IN_STATUS_PENDING)
        .bind(sent_at)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Transition a still-pending check-in to missed and stamp the alert
    /// time. Creates the row if the reminder pipeline never reached this
    /// user. Returns false when the user already completed (or was already
    /// alerted), in which case the caller skips them.
    pub async fn mark_alert_triggered<'c>(
        conn: impl Executor<'c, Database = Sqlite>,
        user_id: i64,
        date: NaiveDate,
        triggered_at: NaiveDateTime,
    ) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            INSERT INTO daily_check_ins (
                user_id, check_in_date, status, alert_triggered_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, check_in_date) DO UPDATE SET
                status = excluded.status,
                alert_triggered_at = excluded.alert_triggered_at,
                updated_at = excluded.updated_at
            WHERE daily_check_ins.status = ?
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(CHECK_IN_STATUS_MISSED)
        .bind(triggered_at)
        .bind(now)
        .bind(now)
        .bind(CHECK_IN_STATUS_PENDING)
        .execute(conn)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::CHECK_IN_STATUS_COMPLETED;
    use crate::db::test_util::{seed_user, test_pool};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    #[tokio::test]
    async fn alert_fires_for_fresh_and_pending_rows_only() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;
        let now = Utc::now().naive_utc();

        // No row yet: the alert creates a missed row.
        let fired = DailyCheckInRepository::mark_alert_triggered(&pool, user.id, date(), now)
            .await
            .unwrap();
        assert!(fired);

        let row = DailyCheckInRepository::find(&pool, user.id, date())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, CHECK_IN_STATUS_MISSED);
        assert!(row.alert_triggered_at.is_some());

        // Already missed: a second alert is a no-op.
        let again = DailyCheckInRepository::mark_alert_triggered(&pool, user.id, date(), now)
            .await
            .unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn completed_check_in_is_not_alerted() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;
        let now = Utc::now().naive_utc();

        DailyCheckInRepository::set_reminder_sent(&pool, user.id, date(), now)
            .await
            .unwrap();
        sqlx::query("UPDATE daily_check_ins SET status = ? WHERE user_id = ?")
            .bind(CHECK_IN_STATUS_COMPLETED)
            .bind(user.id)
            .execute(&pool)
            .await
            .unwrap();

        let fired = DailyCheckInRepository::mark_alert_triggered(&pool, user.id, date(), now)
            .await
            .unwrap();
        assert!(!fired);

        let row = DailyCheckInRepository::find(&pool, user.id, date())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, CHECK_IN_STATUS_COMPLETED);
    }

    #[tokio::test]
    async fn reminder_sent_upsert_is_last_writer_wins() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;

        let first = Utc::now().naive_utc();
        DailyCheckInRepository::set_reminder_sent(&pool, user.id, date(), first)
            .await
            .unwrap();
        let later = first + chrono::Duration::minutes(5);
        DailyCheckInRepository::set_reminder_sent(&pool, user.id, date(), later)
            .await
            .unwrap();

        let row = DailyCheckInRepository::find(&pool, user.id, date())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.reminder_sent_at, Some(later));
        assert_eq!(row.status, CHECK_IN_STATUS_PENDING);
    }
}
