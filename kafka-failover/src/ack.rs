use std::str::FromStr;
use std::time::Duration;

use tracing::{error, warn};

use crate::client::PendingAck;
use crate::error::ConsistencyFatalError;
use crate::interrupt::Interrupt;
use crate::message::AckResult;
use crate::observe::RunObserver;

/// What a missed ack means for the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckTimeoutPolicy {
    /// End the run: the cluster failed to stay available.
    #[default]
    Fatal,
    /// Count it, skip the ledger for that message and carry on.
    RecordAsLoss,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseAckTimeoutPolicyError(String);

impl FromStr for AckTimeoutPolicy {
    type Err = ParseAckTimeoutPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fatal" => Ok(AckTimeoutPolicy::Fatal),
            "record-as-loss" => Ok(AckTimeoutPolicy::RecordAsLoss),
            _ => Err(ParseAckTimeoutPolicyError(s.to_owned())),
        }
    }
}

/// Bounds the wait for a produce acknowledgment and classifies its outcome.
/// Retries, if any, happen inside the client's send path.
#[derive(Debug, Clone, Copy)]
pub struct AckWaiter {
    timeout: Duration,
    policy: AckTimeoutPolicy,
}

impl AckWaiter {
    pub fn new(timeout: Duration, policy: AckTimeoutPolicy) -> Self {
        Self { timeout, policy }
    }

    /// Block until `pending` resolves or the timeout elapses.
    ///
    /// Returns `Ok(None)` only when the ack timed out and the policy is `RecordAsLoss`.
    pub async fn wait(
        &self,
        index: u64,
        pending: PendingAck,
        observer: &dyn RunObserver,
        interrupt: &mut Interrupt,
    ) -> Result<Option<AckResult>, ConsistencyFatalError> {
        let outcome = tokio::select! {
            biased;
            _ = interrupt.raised() => {
                error!("got interrupted while waiting for ack of message {}", index);
                return Err(ConsistencyFatalError::Interrupted("waiting for ack"));
            }
            outcome = tokio::time::timeout(self.timeout, pending) => outcome,
        };

        match outcome {
            Ok(Ok(Some(ack))) => Ok(Some(ack)),
            Ok(Ok(None)) => {
                error!("failed with reason unknown to get ack for message {}", index);
                Err(ConsistencyFatalError::AckMissing { index })
            }
            Ok(Err(source)) => {
                error!(
                    "something must have gone wrong while producing message {}: {}",
                    index, source
                );
                Err(ConsistencyFatalError::AckFailed { index, source })
            }
            Err(_) => {
                observer.ack_missed();
                match self.policy {
                    AckTimeoutPolicy::Fatal => {
                        error!(
                            "failed to get an ack for message {} within {:?}",
                            index, self.timeout
                        );
                        Err(ConsistencyFatalError::AckTimeout {
                            index,
                            timeout: self.timeout,
                        })
                    }
                    AckTimeoutPolicy::RecordAsLoss => {
                        warn!(
                            "no ack for message {} within {:?}, continuing",
                            index, self.timeout
                        );
                        Ok(None)
                    }
                }
            }
        }
    }
}
