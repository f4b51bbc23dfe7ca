//! Handler-level resubmission
//!
//! The engine never rebroadcasts on its own. A relay handler whose
//! submission ends in `ReceiptNotReceived` may submit again under the same
//! relay id, which the destination multisig treats as the same aggregation
//! slot. Every other failure is final for that invocation.

use std::{future::Future, time::Duration};

use eyre::Result;
use tracing::warn;

use crate::evm::client::SubmitError;
use crate::metrics;

/// Resubmission configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResubmitPolicy {
    /// Submissions allowed after the first one
    pub max_resubmits: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ResubmitPolicy {
    fn default() -> Self {
        Self {
            max_resubmits: 2,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl ResubmitPolicy {
    /// No resubmission at all
    pub fn none() -> Self {
        Self {
            max_resubmits: 0,
            ..Self::default()
        }
    }

    /// Backoff before resubmission `attempt` (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn should_resubmit(&self, attempt: u32) -> bool {
        attempt < self.max_resubmits
    }
}

/// Whether an error from a submission path is a confirmation timeout
pub fn is_receipt_timeout(error: &eyre::Report) -> bool {
    error
        .downcast_ref::<SubmitError>()
        .map(SubmitError::is_retryable)
        .unwrap_or(false)
}

/// Run `submit` until it succeeds, fails for good, or the policy is exhausted
pub async fn with_resubmit<F, T, Fut>(
    policy: &ResubmitPolicy,
    event: &str,
    mut submit: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match submit().await {
            Ok(result) => return Ok(result),
            Err(e) if is_receipt_timeout(&e) && policy.should_resubmit(attempt) => {
                let backoff = policy.backoff_for_attempt(attempt);
                warn!(
                    event,
                    attempt = attempt + 1,
                    max = policy.max_resubmits,
                    ?backoff,
                    error = %e,
                    "No receipt, resubmitting under the same relay id"
                );
                metrics::RESUBMISSIONS.with_label_values(&[event]).inc();
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
