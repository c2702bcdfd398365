//! Completion hashing and ledger settlement.
//!
//! The verification hash is a SHA-256 over every verified checkpoint's
//! `id:type:target:confidence:verified_at`, ordered by the checkpoint ordering
//! field and joined with `|`. Posting the hash to the ledger is time-boxed;
//! failures fall back to background retries that never touch task status.

use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ledger::{Ledger, LedgerError, LedgerReceipt};
use crate::store::Checkpoint;

/// Deterministic digest over the verified checkpoints of a task.
///
/// Unverified checkpoints are ignored. The input order does not matter; rows
/// are sorted by `ordering` (then id) first.
pub fn verification_hash(checkpoints: &[Checkpoint]) -> String {
    let mut verified: Vec<&Checkpoint> = checkpoints.iter().filter(|cp| cp.verified).collect();
    verified.sort_by(|a, b| a.ordering.cmp(&b.ordering).then(a.id.cmp(&b.id)));

    let input = verified
        .iter()
        .map(|cp| {
            format!(
                "{}:{}:{}:{}:{}",
                cp.id,
                cp.kind.as_str(),
                cp.target,
                cp.confidence.unwrap_or(0.0),
                cp.verified_at.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("|");

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Timeout and retry schedule for ledger posts.
#[derive(Debug, Clone)]
pub struct SettlementPolicy {
    /// Hard limit on a single ledger call
    pub timeout: Duration,
    /// Background attempts after the first failure
    pub max_retries: u32,
    /// First retry delay; each later retry doubles it
    pub base_delay: Duration,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl SettlementPolicy {
    /// Delay before retry `attempt` (0-based): base * 2^attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Clone)]
pub struct Settlement {
    ledger: Arc<dyn Ledger>,
    policy: SettlementPolicy,
}

impl Settlement {
    pub fn new(ledger: Arc<dyn Ledger>, policy: SettlementPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn policy(&self) -> &SettlementPolicy {
        &self.policy
    }

    /// One time-boxed ledger call.
    pub async fn record(
        &self,
        task_id: Uuid,
        verification_hash: &str,
        checkpoint_count: usize,
    ) -> Result<LedgerReceipt, LedgerError> {
        match tokio::time::timeout(
            self.policy.timeout,
            self.ledger
                .record(task_id, verification_hash, checkpoint_count),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(self.policy.timeout)),
        }
    }

    /// Retry the ledger post in the background.
    ///
    /// `on_receipt` runs once, after the first successful retry. Exhausting
    /// the retries is logged and otherwise has no effect.
    pub fn spawn_retries<F, Fut>(
        &self,
        task_id: Uuid,
        verification_hash: String,
        checkpoint_count: usize,
        on_receipt: F,
    ) -> tokio::task::JoinHandle<Option<LedgerReceipt>>
    where
        F: FnOnce(LedgerReceipt) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let settlement = self.clone();
        tokio::spawn(async move {
            for attempt in 0..settlement.policy.max_retries {
                let delay = settlement.policy.delay_for(attempt);
                tokio::time::sleep(delay).await;

                match settlement
                    .record(task_id, &verification_hash, checkpoint_count)
                    .await
                {
                    Ok(receipt) => {
                        tracing::info!(
                            task_id = %task_id,
                            attempt = attempt + 1,
                            reference = %receipt.reference,
                            "Ledger receipt recorded on retry"
                        );
                        on_receipt(receipt.clone()).await;
                        return Some(receipt);
                    }
                    Err(e) => {
                        tracing::warn!(
                            task_id = %task_id,
                            attempt = attempt + 1,
                            max_retries = settlement.policy.max_retries,
                            error = %e,
                            "Ledger retry failed"
                        );
                    }
                }
            }

            tracing::error!(
                task_id = %task_id,
                verification_hash = %verification_hash,
                "Ledger retries exhausted; completion hash was not recorded"
            );
            None
        })
    }
}
