use chrono::Utc;
use sqlx::{Executor, Sqlite};

use crate::db::models::ContactAttempt;
use crate::error::{AppError, AppResult};

pub struct ContactAttemptRepository;

impl ContactAttemptRepository {
    /// Append one attempt row. The log is append-only; delivery progress is
    /// recorded as new rows, never as updates.
    pub async fn append<'c>(
        conn: impl Executor<'c, Database = Sqlite>,
        task_id: i64,
        user_id: i64,
        phone_hash: &str,
        state: &str,
        provider_result: Option<&str>,
    ) -> AppResult<ContactAttempt> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, ContactAttempt>(
            r#"
            INSERT INTO contact_attempts (
                task_id, user_id, phone_hash, state, provider_result, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, task_id, user_id, phone_hash, state, provider_result, created_at
            "#,
        )
        .bind(task_id)
        .bind(user_id)
        .bind(phone_hash)
        .bind(state)
        .bind(provider_result)
        .bind(now)
        .fetch_one(conn)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }
}
