pub mod models;
pub mod repository;

pub use models::*;
pub use repository::*;

#[cfg(test)]
pub(crate) mod test_util {
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    use super::models::User;

    /// In-memory pool with the full schema applied. Single connection so
    /// every query sees the same database.
    pub(crate) async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations");
        pool
    }

    pub(crate) async fn seed_user(pool: &SqlitePool, public_id: &str, enabled: bool) -> User {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (
                public_id, timezone, check_in_enabled,
                remind_at, deadline, grace_until, status,
                created_at, updated_at
            ) VALUES (?, 'Asia/Shanghai', ?, '20:00:00', '21:00:00', NULL, 'active', ?, ?)
            RETURNING
                id, public_id, timezone, check_in_enabled,
                remind_at, deadline, grace_until, status,
                created_at, updated_at
            "#,
        )
        .bind(public_id)
        .bind(enabled)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .expect("seed user")
    }
}
