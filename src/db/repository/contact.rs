use sqlx::SqlitePool;

use crate::db::models::EmergencyContact;
use crate::error::{AppError, AppResult};

pub struct EmergencyContactRepository;

impl EmergencyContactRepository {
    /// A user's contacts ordered by priority, most urgent first.
    pub async fn list_for_user(pool: &SqlitePool, user_id: i64) -> AppResult<Vec<EmergencyContact>> {
        let rows = sqlx::query_as::<_, EmergencyContact>(
            r#"
            SELECT id, user_id, priority, phone_hash, display_name, created_at
            FROM emergency_contacts
            WHERE user_id = ?
            ORDER BY priority ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
