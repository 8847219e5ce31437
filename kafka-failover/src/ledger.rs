use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;
use tracing::warn;

use crate::error::ConsistencyFatalError;
use crate::message::{AckResult, ConsumedMessage, Payload};
use crate::run_id::RunId;

/// Why a consumed record could not be matched with a produced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedReason {
    /// Left on the topic by another run.
    PreviousRun,
    /// Carries this run's id, but no ack was recorded for it.
    NotProduced,
}

impl fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnmatchedReason::PreviousRun => write!(f, "produced by a previous run"),
            UnmatchedReason::NotProduced => write!(f, "never produced in this run"),
        }
    }
}

/// Deviations from the delivery guarantees under test. These are measurements,
/// not reasons to stop the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    #[error("message {index} already has a produced record")]
    DuplicateProduce { index: u64 },
    #[error("consumed {key} at {partition}:{offset} was {reason}")]
    Unmatched {
        key: String,
        partition: i32,
        offset: i64,
        reason: UnmatchedReason,
    },
    #[error("message {index} consumed {occurrences} times")]
    Duplicate { index: u64, occurrences: usize },
    #[error("message {index} consumed on partition {partition} after message {previous}")]
    Reordered {
        partition: i32,
        index: u64,
        previous: u64,
    },
}

/// Everything known about one iteration's message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerEntry {
    pub produced: Option<AckResult>,
    pub consumed: Vec<ConsumedMessage>,
}

impl LedgerEntry {
    pub fn is_lost(&self) -> bool {
        self.produced.is_some() && self.consumed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    /// Messages acked by the broker.
    pub produced: usize,
    /// Records of this run returned by polls, duplicates included.
    pub consumed: usize,
    /// Acked messages consumed at least once.
    pub matched: usize,
    /// Acked messages never consumed.
    pub lost: usize,
    /// Deliveries beyond the first one.
    pub duplicates: usize,
    /// Indices acked more than once, only the first ack is kept.
    pub duplicate_acks: usize,
    pub unmatched: usize,
    pub reordered: usize,
}

/// Correlates produced and consumed messages of one run. Entries are never
/// pruned, the size of a run is bounded by its iteration count.
#[derive(Debug)]
pub struct ConsistencyLedger {
    run_id: RunId,
    duplicates_tolerated: usize,
    entries: BTreeMap<u64, LedgerEntry>,
    anomalies: Vec<Anomaly>,
    /// Highest index consumed so far, per partition.
    high_marks: HashMap<(String, i32), u64>,
}

impl ConsistencyLedger {
    pub fn new(run_id: RunId, duplicates_tolerated: usize) -> Self {
        Self {
            run_id,
            duplicates_tolerated,
            entries: BTreeMap::new(),
            anomalies: Vec::new(),
            high_marks: HashMap::new(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn entry(&self, index: u64) -> Option<&LedgerEntry> {
        self.entries.get(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    /// Indexes that were acked but never consumed.
    pub fn lost(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_lost())
            .map(|(index, _)| *index)
            .collect()
    }

    /// Record the ack of the message produced for `index`. A second ack for the
    /// same index is rejected and recorded as an anomaly.
    pub fn on_produced(&mut self, index: u64, ack: AckResult) -> Result<(), Anomaly> {
        let entry = self.entries.entry(index).or_default();
        if entry.produced.is_some() {
            let anomaly = Anomaly::DuplicateProduce { index };
            self.anomalies.push(anomaly.clone());
            return Err(anomaly);
        }
        entry.produced = Some(ack);
        Ok(())
    }

    /// Correlate a consumed record with the entry it was produced for.
    ///
    /// Stale, duplicated or reordered records are recorded as anomalies. A record
    /// whose correlation key can't be decoded means the ledger can't be trusted
    /// anymore, and is fatal.
    pub fn on_consumed(&mut self, record: ConsumedMessage) -> Result<(), ConsistencyFatalError> {
        let payload = self.decode(&record)?;

        if payload.run_id != self.run_id {
            self.record(Anomaly::Unmatched {
                key: payload.key(),
                partition: record.partition,
                offset: record.offset,
                reason: UnmatchedReason::PreviousRun,
            });
            return Ok(());
        }

        let index = payload.index;
        let partition = (record.topic.clone(), record.partition);
        match self.high_marks.get(&partition) {
            Some(&previous) if index < previous => self.record(Anomaly::Reordered {
                partition: record.partition,
                index,
                previous,
            }),
            _ => {
                self.high_marks.insert(partition, index);
            }
        }

        let entry = self.entries.entry(index).or_default();
        let produced = entry.produced.is_some();
        let (partition, offset) = (record.partition, record.offset);
        entry.consumed.push(record);
        let occurrences = entry.consumed.len();

        if !produced {
            self.record(Anomaly::Unmatched {
                key: payload.key(),
                partition,
                offset,
                reason: UnmatchedReason::NotProduced,
            });
        }
        if occurrences > 1 {
            self.record(Anomaly::Duplicate { index, occurrences });
        }

        Ok(())
    }

    pub fn summary(&self) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        for entry in self.entries.values() {
            summary.consumed += entry.consumed.len();
            summary.duplicates += entry.consumed.len().saturating_sub(1);
            if entry.produced.is_some() {
                summary.produced += 1;
                if entry.consumed.is_empty() {
                    summary.lost += 1;
                } else {
                    summary.matched += 1;
                }
            }
        }
        for anomaly in &self.anomalies {
            match anomaly {
                Anomaly::Unmatched { .. } => summary.unmatched += 1,
                Anomaly::Reordered { .. } => summary.reordered += 1,
                Anomaly::DuplicateProduce { .. } => summary.duplicate_acks += 1,
                Anomaly::Duplicate { .. } => {}
            }
        }
        summary
    }

    /// Summarize the run, failing if any message was delivered more often than tolerated.
    pub fn verdict(&self) -> Result<LedgerSummary, ConsistencyFatalError> {
        let limit = 1 + self.duplicates_tolerated;
        if let Some((index, entry)) = self
            .entries
            .iter()
            .find(|(_, entry)| entry.consumed.len() > limit)
        {
            return Err(ConsistencyFatalError::DuplicatesExceeded {
                index: *index,
                occurrences: entry.consumed.len(),
                tolerated: self.duplicates_tolerated,
            });
        }
        Ok(self.summary())
    }

    fn decode(&self, record: &ConsumedMessage) -> Result<Payload, ConsistencyFatalError> {
        let value = record.value.as_deref().ok_or_else(|| {
            ConsistencyFatalError::LedgerIntegrity(format!(
                "record at {}:{} has no value",
                record.partition, record.offset
            ))
        })?;
        let payload = Payload::parse(value).map_err(|e| {
            ConsistencyFatalError::LedgerIntegrity(format!(
                "unparseable value at {}:{}: {}",
                record.partition, record.offset, e
            ))
        })?;
        let key = payload.key();
        if record.key.as_deref() != Some(key.as_str()) {
            return Err(ConsistencyFatalError::LedgerIntegrity(format!(
                "key {:?} at {}:{} does not match its value {}",
                record.key, record.partition, record.offset, key
            )));
        }
        Ok(payload)
    }

    fn record(&mut self, anomaly: Anomaly) {
        warn!("consistency anomaly: {}", anomaly);
        self.anomalies.push(anomaly);
    }
}
