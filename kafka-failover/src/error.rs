use std::time;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of conditions that end a run. Once one of these is raised, no
/// further iterations execute and the measurements gathered so far can't be trusted.
#[derive(Error, Debug)]
pub enum ConsistencyFatalError {
    #[error("failed to get an ack for message {index} within {timeout:?}")]
    AckTimeout { index: u64, timeout: time::Duration },
    #[error("ack missing for unknown reason for message {index}")]
    AckMissing { index: u64 },
    #[error("something went wrong while producing message {index}: {source}")]
    AckFailed {
        index: u64,
        #[source]
        source: KafkaError,
    },
    #[error("failed to hand message {index} to the producer: {source}")]
    SendFailed {
        index: u64,
        #[source]
        source: KafkaError,
    },
    #[error("got interrupted while {0}")]
    Interrupted(&'static str),
    #[error("ledger can no longer make sense of its data: {0}")]
    LedgerIntegrity(String),
    #[error("message {index} was consumed {occurrences} times, more than the {tolerated} duplicates tolerated")]
    DuplicatesExceeded {
        index: u64,
        occurrences: usize,
        tolerated: usize,
    },
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("kafka client error: {0}")]
    Client(#[from] KafkaError),
}
