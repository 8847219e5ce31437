use serde::Deserialize;
use serde_json::json;

use crate::run_id::RunId;

/// A message about to be produced for one iteration. The value is self-describing,
/// so the consuming side can correlate it without looking anything up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub index: u64,
    pub topic: String,
    pub key: String,
    pub value: String,
}

impl OutgoingMessage {
    pub fn new(run_id: &RunId, index: u64, topic: &str) -> Self {
        let produced_at_ms =
            (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let value = json!({
            "run_id": run_id,
            "index": index,
            "produced_at_ms": produced_at_ms,
        });

        Self {
            index,
            topic: topic.to_owned(),
            key: correlation_key(run_id, index),
            value: value.to_string(),
        }
    }
}

/// The correlation key embedded as the record key of every produced message.
pub fn correlation_key(run_id: &RunId, index: u64) -> String {
    format!("{}.{}", run_id, index)
}

/// Broker acknowledgment of a produced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
    pub serialized_key_size: usize,
    pub serialized_value_size: usize,
}

/// One record returned by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
    pub key: Option<String>,
    pub value: Option<String>,
}

/// The decoded value of a message produced by this harness.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Payload {
    pub run_id: RunId,
    pub index: u64,
    pub produced_at_ms: i64,
}

impl Payload {
    pub fn parse(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }

    pub fn key(&self) -> String {
        correlation_key(&self.run_id, self.index)
    }
}
