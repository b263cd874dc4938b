//! Polling wait for transaction confirmations

use crate::errors::ExternalServiceError;
use crate::escrow::ledger::{ConfirmationStatus, LedgerClient};
use std::sync::Arc;
use std::time::Duration;

/// Waits until a signature reaches a confirmation threshold
#[derive(Clone)]
pub struct ConfirmationWaiter {
    ledger: Arc<dyn LedgerClient>,
    poll_interval: Duration,
    timeout: Duration,
}

impl ConfirmationWaiter {
    pub fn new(ledger: Arc<dyn LedgerClient>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            ledger,
            poll_interval,
            timeout,
        }
    }

    /// Wait for `threshold` confirmations (or finalization).
    ///
    /// Returns the confirmation count observed; a finalized transaction reports
    /// `threshold`.
    pub async fn wait_for_confirmation(&self, signature: &str, threshold: u32) -> Result<u32, ConfirmationError> {
        match tokio::time::timeout(self.timeout, self.poll(signature, threshold)).await {
            Ok(result) => result,
            Err(_) => Err(ConfirmationError::Timeout {
                signature: signature.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    async fn poll(&self, signature: &str, threshold: u32) -> Result<u32, ConfirmationError> {
        loop {
            match self.ledger.confirmation_status(signature).await {
                Ok(ConfirmationStatus::Finalized) => return Ok(threshold),
                Ok(ConfirmationStatus::Pending { confirmations }) if confirmations >= threshold => {
                    return Ok(confirmations);
                }
                Ok(ConfirmationStatus::Pending { confirmations }) => {
                    tracing::trace!(signature, confirmations, threshold, "Waiting for confirmations");
                }
                Ok(ConfirmationStatus::NotFound) => {
                    tracing::trace!(signature, "Transaction not visible yet");
                }
                Ok(ConfirmationStatus::Failed { reason }) => {
                    return Err(ConfirmationError::Failed {
                        signature: signature.to_string(),
                        reason,
                    });
                }
                // Transient; keep polling until the timeout
                Err(e) => tracing::warn!(signature, "Confirmation status query failed: {}", e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfirmationError {
    #[error("Transaction {signature} not confirmed within {timeout_ms}ms")]
    Timeout { signature: String, timeout_ms: u64 },

    #[error("Transaction {signature} failed: {reason}")]
    Failed { signature: String, reason: String },
}

impl From<ConfirmationError> for ExternalServiceError {
    fn from(err: ConfirmationError) -> Self {
        match err {
            ConfirmationError::Timeout { signature, timeout_ms } => {
                ExternalServiceError::ConfirmationTimeout { signature, timeout_ms }
            }
            ConfirmationError::Failed { signature, reason } => {
                ExternalServiceError::TransactionFailed { signature, reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLedger;

    #[tokio::test(start_paused = true)]
    async fn test_confirms_at_threshold() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_status("sig-1", ConfirmationStatus::Pending { confirmations: 1 });

        let waiter = ConfirmationWaiter::new(ledger.clone(), Duration::from_millis(100), Duration::from_secs(5));
        let bump = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(350)).await;
                ledger.set_status("sig-1", ConfirmationStatus::Pending { confirmations: 3 });
            })
        };

        let confirmations = waiter.wait_for_confirmation("sig-1", 3).await.expect("confirmed");
        assert_eq!(confirmations, 3);
        bump.await.expect("bump task");
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_never_seen() {
        let ledger = Arc::new(MockLedger::new());
        let waiter = ConfirmationWaiter::new(ledger, Duration::from_millis(100), Duration::from_secs(1));

        match waiter.wait_for_confirmation("missing", 3).await {
            Err(ConfirmationError::Timeout { signature, timeout_ms }) => {
                assert_eq!(signature, "missing");
                assert_eq!(timeout_ms, 1000);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_failure_is_terminal() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_status(
            "sig-2",
            ConfirmationStatus::Failed {
                reason: "insufficient funds".to_string(),
            },
        );
        let waiter = ConfirmationWaiter::new(ledger, Duration::from_millis(100), Duration::from_secs(5));

        let err = waiter.wait_for_confirmation("sig-2", 3).await.expect_err("failed");
        assert!(matches!(err, ConfirmationError::Failed { .. }));
        assert!(err.to_string().contains("insufficient funds"));
    }
}
