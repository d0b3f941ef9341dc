use sqlx::SqlitePool;

use crate::db::models::{User, USER_STATUS_ACTIVE};
use crate::error::{AppError, AppResult};

pub struct UserRepository;

impl UserRepository {
    /// All users eligible for the daily fan-out: check-in enabled and
    /// account active.
    pub async fn list_check_in_enabled(pool: &SqlitePool) -> AppResult<Vec<User>> {
        let rows = sqlx::query_as::<_, User>(
            r#"
            SELECT
                id, public_id, timezone, check_in_enabled,
                remind_at, deadline, grace_until, status,
                created_at, updated_at
            FROM users
            WHERE check_in_enabled = 1 AND status = ?
            ORDER BY id ASC
            "#,
        )
        .bind(USER_STATUS_ACTIVE)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: i64) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            r#"
            SELECT
                id, public_id, timezone, check_in_enabled,
                remind_at, deadline, grace_until, status,
                created_at, updated_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_public_id(pool: &SqlitePool, public_id: &str) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            r#"
            SELECT
                id, public_id, timezone, check_in_enabled,
                remind_at, deadline, grace_until, status,
                created_at, updated_at
            FROM users
            WHERE public_id = ?
            "#,
        )
        .bind(public_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Fetch a batch of users by internal id. Missing ids are simply absent
    /// from the result.
    pub async fn find_by_ids(pool: &SqlitePool, ids: &[i64]) -> AppResult<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT
                id, public_id, timezone, check_in_enabled,
                remind_at, deadline, grace_until, status,
                created_at, updated_at
            FROM users
            WHERE id IN ({placeholders})
            "#
        );

        let mut query = sqlx::query_as::<_, User>(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(pool).await.map_err(AppError::Database)?;
        Ok(rows)
    }
}
