use chrono::NaiveDate;
use sqlx::SqlitePool;

use crate::error::{AppError, AppResult};

pub struct SmsQuotaRepository;

impl SmsQuotaRepository {
    /// Debit one unit from the user's daily allowance. The row is seeded
    /// lazily with `daily_allowance`; the debit itself is a guarded UPDATE
    /// so concurrent workers cannot overdraw. Returns false when the quota
    /// is exhausted.
    pub async fn debit(
        pool: &SqlitePool,
        user_id: i64,
        date: NaiveDate,
        daily_allowance: i64,
    ) -> AppResult<bool> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO sms_quotas (user_id, period_date, remaining)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(daily_allowance)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        let result = sqlx::query(
            r#"
            UPDATE sms_quotas
            SET remaining = remaining - 1
            WHERE user_id = ? AND period_date = ? AND remaining > 0
            "#,
        )
        .bind(user_id)
        .bind(date)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    #[allow(dead_code)]
    pub async fn remaining(pool: &SqlitePool, user_id: i64, date: NaiveDate) -> AppResult<i64> {
        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT remaining FROM sms_quotas
            WHERE user_id = ? AND period_date = ?
            "#,
        )
        .bind(user_id)
        .bind(date)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(remaining.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{seed_user, test_pool};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    #[tokio::test]
    async fn debit_exhausts_exactly_at_the_allowance() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;

        assert!(SmsQuotaRepository::debit(&pool, user.id, date(), 2).await.unwrap());
        assert!(SmsQuotaRepository::debit(&pool, user.id, date(), 2).await.unwrap());
        assert!(!SmsQuotaRepository::debit(&pool, user.id, date(), 2).await.unwrap());

        assert_eq!(
            SmsQuotaRepository::remaining(&pool, user.id, date()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn allowance_is_seeded_once_per_day() {
        let pool = test_pool().await;
        let user = seed_user(&pool, "u-1", true).await;

        assert!(SmsQuotaRepository::debit(&pool, user.id, date(), 3).await.unwrap());
        // A later debit with a different configured allowance must not
        // reseed the existing row.
        assert!(SmsQuotaRepository::debit(&pool, user.id, date(), 100).await.unwrap());
        assert_eq!(
            SmsQuotaRepository::remaining(&pool, user.id, date()).await.unwrap(),
            1
        );
    }
}
