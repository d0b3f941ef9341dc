//! Short-lived idempotency state: message claims, processed flags and
//! per-user scheduling marks. Everything here is TTL'd; the durable store
//! remains the single source of truth.

use chrono::NaiveDate;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::CacheConfig;
use crate::error::AppResult;

/// Which per-user scheduling mark to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Reminder,
    Timeout,
    /// Convenience kind meaning "both reminder and timeout are set".
    CheckIn,
}

impl ScheduleKind {
    fn as_str(self) -> &'static str {
        match self {
            ScheduleKind::Reminder => "reminder",
            ScheduleKind::Timeout => "timeout",
            ScheduleKind::CheckIn => "checkin",
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyStore {
    conn: ConnectionManager,
    prefix: String,
}

impl IdempotencyStore {
    pub async fn connect(cfg: &CacheConfig) -> AppResult<Self> {
        let client = redis::Client::open(cfg.url.as_str())?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            prefix: cfg.key_prefix.clone(),
        })
    }

    fn claim_key(&self, message_id: i64) -> String {
        format!("{}:msg:processing:{}", self.prefix, message_id)
    }

    fn done_key(&self, message_id: i64) -> String {
        format!("{}:msg:done:{}", self.prefix, message_id)
    }

    fn sched_key(&self, kind: ScheduleKind, date: NaiveDate, user_id: i64) -> String {
        format!("{}:sched:{}:{}:{}", self.prefix, kind.as_str(), date, user_id)
    }

    fn quota_event_key(&self, date: NaiveDate, user_id: i64) -> String {
        format!("{}:evt:quota:{}:{}", self.prefix, date, user_id)
    }

    /// Atomic set-if-absent on the claim flag. Returns true exactly once
    /// per message id within the TTL. A false return is authoritative:
    /// someone else holds the claim or the message is done.
    pub async fn try_claim_message(&self, message_id: i64, ttl_seconds: u64) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.claim_key(message_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    /// Idempotent processed flag. Also drops the claim so the key space
    /// does not carry both markers for the full claim TTL.
    pub async fn mark_processed(&self, message_id: i64, ttl_seconds: u64) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(self.done_key(message_id), 1, ttl_seconds).await?;
        let _: () = conn.del(self.claim_key(message_id)).await?;
        Ok(())
    }

    /// Release a claim after a retryable failure so redelivery can win it.
    pub async fn unclaim(&self, message_id: i64) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.claim_key(message_id)).await?;
        Ok(())
    }

    pub async fn mark_scheduled(
        &self,
        kind: ScheduleKind,
        date: NaiveDate,
        user_id: i64,
        ttl_seconds: u64,
    ) -> AppResult<()> {
        let mut conn = self.conn.clone();
        match kind {
            ScheduleKind::Reminder | ScheduleKind::Timeout => {
                let _: () = conn
                    .set_ex(self.sched_key(kind, date, user_id), 1, ttl_seconds)
                    .await?;
            }
            ScheduleKind::CheckIn => {
                let _: () = conn
                    .set_ex(
                        self.sched_key(ScheduleKind::Reminder, date, user_id),
                        1,
                        ttl_seconds,
                    )
                    .await?;
                let _: () = conn
                    .set_ex(
                        self.sched_key(ScheduleKind::Timeout, date, user_id),
                        1,
                        ttl_seconds,
                    )
                    .await?;
                let _: () = conn
                    .set_ex(self.sched_key(kind, date, user_id), 1, ttl_seconds)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn is_scheduled(
        &self,
        kind: ScheduleKind,
        date: NaiveDate,
        user_id: i64,
    ) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        match kind {
            ScheduleKind::Reminder | ScheduleKind::Timeout => {
                let exists: bool = conn.exists(self.sched_key(kind, date, user_id)).await?;
                Ok(exists)
            }
            ScheduleKind::CheckIn => {
                let shortcut: bool = conn.exists(self.sched_key(kind, date, user_id)).await?;
                if shortcut {
                    return Ok(true);
                }
                let reminder: bool = conn
                    .exists(self.sched_key(ScheduleKind::Reminder, date, user_id))
                    .await?;
                let timeout: bool = conn
                    .exists(self.sched_key(ScheduleKind::Timeout, date, user_id))
                    .await?;
                Ok(reminder && timeout)
            }
        }
    }

    /// Claim the once-per-user-per-day quota-depleted event slot.
    pub async fn try_claim_quota_event(
        &self,
        date: NaiveDate,
        user_id: i64,
        ttl_seconds: u64,
    ) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.quota_event_key(date, user_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }
}
