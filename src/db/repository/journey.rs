use chrono::{NaiveDateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};

use crate::db::models::{Journey, JOURNEY_STATUS_ONGOING, JOURNEY_STATUS_TIMEOUT_ALERTED};
use crate::error::{AppError, AppResult};

pub struct JourneyRepository;

impl JourneyRepository {
    pub async fn find_by_id(pool: &SqlitePool, id: i64) -> AppResult<Option<Journey>> {
        let row = sqlx::query_as::<_, Journey>(
            r#"
            SELECT id, user_id, destination, expected_return_time, status,
                   created_at, updated_at
            FROM journeys
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Ongoing journeys whose expected return falls inside the lookahead
    /// window. Fed to the approaching-timeout loop.
    pub async fn list_approaching(
        pool: &SqlitePool,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> AppResult<Vec<Journey>> {
        let rows = sqlx::query_as::<_, Journey>(
            r#"
            SELECT id, user_id, destination, expected_return_time, status,
                   created_at, updated_at
            FROM journeys
            WHERE status = ? AND expected_return_time >= ? AND expected_return_time <= ?
            ORDER BY expected_return_time ASC
            "#,
        )
        .bind(JOURNEY_STATUS_ONGOING)
        .bind(from)
        .bind(to)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Ongoing journeys already past their grace cutoff. Fed to the overdue
    /// compensation loop, which covers anything the delayed pipeline missed.
    pub async fn list_overdue(pool: &SqlitePool, cutoff: NaiveDateTime) -> AppResult<Vec<Journey>> {
        let rows = sqlx::query_as::<_, Journey>(
            r#"
            SELECT id, user_id, destination, expected_return_time, status,
                   created_at, updated_at
            FROM journeys
            WHERE status = ? AND expected_return_time < ?
            ORDER BY expected_return_time ASC
            "#,
        )
        .bind(JOURNEY_STATUS_ONGOING)
        .bind(cutoff)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Guarded transition ongoing -> timeout_alerted. Returns false when the
    /// journey was already closed or alerted; the caller treats that as an
    /// obsolete message.
    pub async fn mark_timeout_alerted<'c>(
        conn: impl Executor<'c, Database = Sqlite>,
        journey_id: i64,
    ) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE journeys
            SET status = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JOURNEY_STATUS_TIMEOUT_ALERTED)
        .bind(now)
        .bind(journey_id)
        .bind(JOURNEY_STATUS_ONGOING)
        .execute(conn)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::JOURNEY_STATUS_RETURNED;
    use crate::db::test_util::{seed_user, test_pool};

    async fn seed_journey(
        pool: &SqlitePool,
        user_id: i64,
        expected_return: NaiveDateTime,
        status: &str,
    ) -> Journey {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, Journey>(
            r#"
            INSERT INTO journeys (
                user_id, destination, expected_return_time, status, created_at, updated_at
            ) VALUES (?, 'trailhead', ?, ?, ?, ?)
            RETURNING id, user_id, destination, expected_return_time, status,
                      created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(expected_return)
        .bind(status)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn timeout_transition_fires_once_and_never_reverts() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;
        let journey = seed_journey(&pool, user.id, Utc::now().naive_utc(), JOURNEY_STATUS_ONGOING)
            .await;

        assert!(JourneyRepository::mark_timeout_alerted(&pool, journey.id)
            .await
            .unwrap());
        assert!(!JourneyRepository::mark_timeout_alerted(&pool, journey.id)
            .await
            .unwrap());

        let row = JourneyRepository::find_by_id(&pool, journey.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, JOURNEY_STATUS_TIMEOUT_ALERTED);
    }

    #[tokio::test]
    async fn returned_journeys_are_not_alerted() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;
        let journey = seed_journey(&pool, user.id, Utc::now().naive_utc(), JOURNEY_STATUS_RETURNED)
            .await;

        assert!(!JourneyRepository::mark_timeout_alerted(&pool, journey.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn window_queries_split_approaching_from_overdue() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;
        let now = Utc::now().naive_utc();

        let soon = seed_journey(
            &pool,
            user.id,
            now + chrono::Duration::minutes(5),
            JOURNEY_STATUS_ONGOING,
        )
        .await;
        let late = seed_journey(
            &pool,
            user.id,
            now - chrono::Duration::minutes(30),
            JOURNEY_STATUS_ONGOING,
        )
        .await;
        // Outside the ten-minute lookahead.
        seed_journey(
            &pool,
            user.id,
            now + chrono::Duration::hours(2),
            JOURNEY_STATUS_ONGOING,
        )
        .await;

        let approaching = JourneyRepository::list_approaching(
            &pool,
            now,
            now + chrono::Duration::minutes(10),
        )
        .await
        .unwrap();
        assert_eq!(approaching.len(), 1);
        assert_eq!(approaching[0].id, soon.id);

        let overdue = JourneyRepository::list_overdue(&pool, now - chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, late.id);
    }
}
