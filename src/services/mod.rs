pub mod check_in;
pub mod init;
pub mod journey;
pub mod outbound;
pub mod scheduler;
pub mod sweeper;

use std::future::Future;

use crate::cache::IdempotencyStore;
use crate::error::ConsumeError;

/// Claim-wrapped message processing shared by every consumer.
///
/// A failed claim is authoritative ("someone else has it or it is done") and
/// maps to a skip. A claim *check* error is tolerated: processing proceeds,
/// accepting the duplicate risk over blocking the queue. Whatever the inner
/// handler returns, the claim never outlives this call un-reconciled: success
/// paths set the processed flag (which drops the claim), failure paths
/// release the claim so redelivery can win it.
pub(crate) async fn with_claim<F, Fut>(
    cache: &IdempotencyStore,
    message_id: i64,
    claim_ttl: u64,
    processed_ttl: u64,
    handler: F,
) -> Result<(), ConsumeError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), ConsumeError>>,
{
    match cache.try_claim_message(message_id, claim_ttl).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(message_id, "Message already claimed or processed; skipping");
            return Err(ConsumeError::Skip);
        }
        Err(e) => {
            tracing::warn!(message_id, "Claim check failed, proceeding anyway: {e}");
        }
    }

    let result = handler().await;

    match &result {
        Ok(()) | Err(ConsumeError::Skip) | Err(ConsumeError::QuotaInsufficient) => {
            if let Err(e) = cache.mark_processed(message_id, processed_ttl).await {
                tracing::warn!(message_id, "Failed to mark message processed: {e}");
            }
        }
        Err(_) => {
            if let Err(e) = cache.unclaim(message_id).await {
                tracing::warn!(message_id, "Failed to release claim: {e}");
            }
        }
    }

    result
}
