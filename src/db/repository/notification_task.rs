use chrono::{NaiveDate, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};

use crate::db::models::{
    CreateNotificationTask, NotificationTask, TASK_STATUS_FAILED, TASK_STATUS_PENDING,
    TASK_STATUS_PROCESSING, TASK_STATUS_SUCCESS,
};
use crate::error::{AppError, AppResult};

pub struct NotificationTaskRepository;

impl NotificationTaskRepository {
    /// Insert one task, tolerating duplicates: a collision with one of the
    /// per-day uniqueness indexes drops the insert and returns None. The
    /// freshly minted task_code never collides, so an ignored insert always
    /// means "an equivalent live task already exists".
    pub async fn create<'c>(
        conn: impl Executor<'c, Database = Sqlite>,
        task: CreateNotificationTask,
    ) -> AppResult<Option<NotificationTask>> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, NotificationTask>(
            r#"
            INSERT OR IGNORE INTO notification_tasks (
                task_code, user_id, category, channel,
                contact_phone_hash, payload, status, task_date,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING
                id, task_code, user_id, category, channel,
                contact_phone_hash, payload, status, task_date,
                created_at, updated_at
            "#,
        )
        .bind(task.task_code)
        .bind(task.user_id)
        .bind(&task.category)
        .bind(&task.channel)
        .bind(&task.contact_phone_hash)
        .bind(&task.payload)
        .bind(TASK_STATUS_PENDING)
        .bind(task.task_date)
        .bind(now)
        .bind(now)
        .fetch_optional(conn)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_task_code(
        pool: &SqlitePool,
        task_code: i64,
    ) -> AppResult<Option<NotificationTask>> {
        let row = sqlx::query_as::<_, NotificationTask>(
            r#"
            SELECT
                id, task_code, user_id, category, channel,
                contact_phone_hash, payload, status, task_date,
                created_at, updated_at
            FROM notification_tasks
            WHERE task_code = ?
            "#,
        )
        .bind(task_code)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Users in `user_ids` that already have a task for the given day in
    /// any of `categories`. Used by the daily scheduler to exclude users
    /// even when the cache marks were lost.
    pub async fn list_user_ids_with_tasks(
        pool: &SqlitePool,
        date: NaiveDate,
        categories: &[&str],
        user_ids: &[i64],
    ) -> AppResult<Vec<i64>> {
        if categories.is_empty() || user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let cat_placeholders = vec!["?"; categories.len()].join(", ");
        let user_placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT DISTINCT user_id
            FROM notification_tasks
            WHERE task_date = ?
              AND category IN ({cat_placeholders})
              AND user_id IN ({user_placeholders})
            "#
        );

        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(date);
        for category in categories {
            query = query.bind(*category);
        }
        for user_id in user_ids {
            query = query.bind(user_id);
        }

        let rows = query.fetch_all(pool).await.map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Atomic pending -> processing claim by task code, in the same
    /// UPDATE-RETURNING shape the outbound worker relies on for the
    /// at-most-once send guarantee.
    pub async fn claim_for_processing(
        pool: &SqlitePool,
        task_code: i64,
    ) -> AppResult<Option<NotificationTask>> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, NotificationTask>(
            r#"
            UPDATE notification_tasks
            SET status = ?, updated_at = ?
            WHERE task_code = ? AND status = ?
            RETURNING
                id, task_code, user_id, category, channel,
                contact_phone_hash, payload, status, task_date,
                created_at, updated_at
            "#,
        )
        .bind(TASK_STATUS_PROCESSING)
        .bind(now)
        .bind(task_code)
        .bind(TASK_STATUS_PENDING)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Return a processing task to pending after a transient send failure
    /// so the requeued message can claim it again.
    pub async fn release_to_pending(pool: &SqlitePool, task_code: i64) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            r#"
            UPDATE notification_tasks
            SET status = ?, updated_at = ?
            WHERE task_code = ? AND status = ?
            "#,
        )
        .bind(TASK_STATUS_PENDING)
        .bind(now)
        .bind(task_code)
        .bind(TASK_STATUS_PROCESSING)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn mark_success(pool: &SqlitePool, task_code: i64) -> AppResult<()> {
        Self::set_status(pool, task_code, TASK_STATUS_SUCCESS).await
    }

    pub async fn mark_failed(pool: &SqlitePool, task_code: i64) -> AppResult<()> {
        Self::set_status(pool, task_code, TASK_STATUS_FAILED).await
    }

    async fn set_status(pool: &SqlitePool, task_code: i64, status: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            r#"
            UPDATE notification_tasks
            SET status = ?, updated_at = ?
            WHERE task_code = ?
            "#,
        )
        .bind(status)
        .bind(now)
        .bind(task_code)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{seed_user, test_pool};
    use chrono::NaiveDate;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn task(code: i64, user_id: i64, contact: Option<&str>) -> CreateNotificationTask {
        CreateNotificationTask {
            task_code: code,
            user_id,
            category: "checkin_reminder".to_string(),
            channel: "sms".to_string(),
            contact_phone_hash: contact.map(str::to_string),
            payload: "{}".to_string(),
            task_date: date(),
        }
    }

    #[tokio::test]
    async fn second_self_directed_task_per_day_is_dropped() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;

        let first = NotificationTaskRepository::create(&pool, task(101, user.id, None))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = NotificationTaskRepository::create(&pool, task(102, user.id, None))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn failed_task_frees_the_daily_slot() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;

        NotificationTaskRepository::create(&pool, task(101, user.id, None))
            .await
            .unwrap()
            .unwrap();
        NotificationTaskRepository::mark_failed(&pool, 101).await.unwrap();

        let replacement = NotificationTaskRepository::create(&pool, task(102, user.id, None))
            .await
            .unwrap();
        assert!(replacement.is_some());
    }

    #[tokio::test]
    async fn contact_tasks_dedupe_per_contact() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;

        let a = NotificationTaskRepository::create(&pool, task(201, user.id, Some("hash-a")))
            .await
            .unwrap();
        let b = NotificationTaskRepository::create(&pool, task(202, user.id, Some("hash-b")))
            .await
            .unwrap();
        let dup = NotificationTaskRepository::create(&pool, task(203, user.id, Some("hash-a")))
            .await
            .unwrap();

        assert!(a.is_some());
        assert!(b.is_some());
        assert!(dup.is_none());
    }

    #[tokio::test]
    async fn processing_claim_wins_exactly_once() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;
        NotificationTaskRepository::create(&pool, task(301, user.id, None))
            .await
            .unwrap()
            .unwrap();

        let won = NotificationTaskRepository::claim_for_processing(&pool, 301)
            .await
            .unwrap();
        assert!(won.is_some());
        assert_eq!(won.unwrap().status, TASK_STATUS_PROCESSING);

        let lost = NotificationTaskRepository::claim_for_processing(&pool, 301)
            .await
            .unwrap();
        assert!(lost.is_none());
    }

    #[tokio::test]
    async fn released_task_can_be_claimed_again() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;
        NotificationTaskRepository::create(&pool, task(401, user.id, None))
            .await
            .unwrap()
            .unwrap();

        NotificationTaskRepository::claim_for_processing(&pool, 401)
            .await
            .unwrap()
            .unwrap();
        NotificationTaskRepository::release_to_pending(&pool, 401)
            .await
            .unwrap();

        let reclaimed = NotificationTaskRepository::claim_for_processing(&pool, 401)
            .await
            .unwrap();
        assert!(reclaimed.is_some());
    }

    #[tokio::test]
    async fn existing_task_filter_reports_only_matching_users() {
        let pool = test_pool().await;
        let with_task = seed_user(&pool, "u-1", true).await;
        let without_task = seed_user(&pool, "u-2", true).await;
        NotificationTaskRepository::create(&pool, task(501, with_task.id, None))
            .await
            .unwrap()
            .unwrap();

        let hits = NotificationTaskRepository::list_user_ids_with_tasks(
            &pool,
            date(),
            &["checkin_reminder", "checkin_timeout"],
            &[with_task.id, without_task.id],
        )
        .await
        .unwrap();

        assert_eq!(hits, vec![with_task.id]);
    }
}
