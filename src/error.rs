#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Delay of {requested_ms} ms exceeds the broker ceiling of {max_ms} ms")]
    DelayTooLarge { requested_ms: i64, max_ms: i64 },

    #[error("Outbound provider error: {0}")]
    Provider(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

/// Outcome of processing one broker delivery. The consume loop maps each
/// variant to an ack/nack decision; see [`Disposition`].
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// The message is obsolete: already claimed or processed elsewhere, the
    /// user disabled check-in, the journey was closed. Acked, never DLQ'd.
    #[error("message skipped")]
    Skip,

    /// Contract violation (malformed payload, missing task code, unknown
    /// category). Routed to the DLQ for operator inspection.
    #[error("non-retryable: [{code}] {reason}")]
    NonRetryable { code: &'static str, reason: String },

    /// The user's quota is exhausted. Treated as processed so the message
    /// does not loop; the handler emits a quota event instead.
    #[error("quota insufficient")]
    QuotaInsufficient,

    /// Transient failure (database, broker, cache, provider). The claim is
    /// released and the message requeued.
    #[error(transparent)]
    Retryable(#[from] AppError),
}

impl ConsumeError {
    pub fn bad_payload(reason: impl Into<String>) -> Self {
        ConsumeError::NonRetryable {
            code: "BAD_PAYLOAD",
            reason: reason.into(),
        }
    }
}

/// What the consume loop should do with the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Nack with requeue.
    Requeue,
    /// Nack without requeue; the broker dead-letters the message.
    DeadLetter,
}

pub fn disposition(result: &Result<(), ConsumeError>) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(ConsumeError::Skip) => Disposition::Ack,
        Err(ConsumeError::QuotaInsufficient) => Disposition::Ack,
        Err(ConsumeError::NonRetryable { .. }) => Disposition::DeadLetter,
        Err(ConsumeError::Retryable(_)) => Disposition::Requeue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_and_quota_are_acked() {
        assert_eq!(disposition(&Ok(())), Disposition::Ack);
        assert_eq!(disposition(&Err(ConsumeError::Skip)), Disposition::Ack);
        assert_eq!(
            disposition(&Err(ConsumeError::QuotaInsufficient)),
            Disposition::Ack
        );
    }

    #[test]
    fn contract_violations_dead_letter() {
        let result: Result<(), ConsumeError> = Err(ConsumeError::bad_payload("no task code"));
        assert_eq!(disposition(&result), Disposition::DeadLetter);
    }

    #[test]
    fn transient_failures_requeue() {
        let result: Result<(), ConsumeError> = Err(ConsumeError::Retryable(AppError::Config(
            "broker offline".to_string(),
        )));
        assert_eq!(disposition(&result), Disposition::Requeue);
    }
}
