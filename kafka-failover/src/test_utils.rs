use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::error::KafkaError;
use tokio::time::Instant;

use crate::client::{ConsumeClient, PendingAck, ProduceClient};
use crate::message::{AckResult, ConsumedMessage, OutgoingMessage};
use crate::rebalance::{PartitionSeeker, RebalanceListener, TopicPartition};

/// How the cluster answers one send.
#[derive(Debug, Clone)]
pub enum AckBehaviour {
    /// Append the record and ack it after the delay.
    After(Duration),
    /// Append nothing, resolve without a result.
    Missing,
    /// Append nothing, resolve with the error.
    Fail(KafkaError),
    /// Refuse the send itself.
    Reject(KafkaError),
}

struct Record {
    key: Option<String>,
    value: Option<String>,
}

struct ClusterState {
    topic: String,
    logs: Vec<Vec<Record>>,
    default_ack: AckBehaviour,
    scripted_acks: HashMap<u64, AckBehaviour>,
    sends: Vec<Instant>,
    polls: u64,
    rebalances: HashSet<u64>,
    poll_failures: HashMap<u64, KafkaError>,
    cursors: BTreeMap<i32, i64>,
    seeks: u64,
    seek_failures: HashMap<u64, KafkaError>,
    rebalance_error: Option<KafkaError>,
    listener: Option<Arc<dyn RebalanceListener>>,
    producer_closed: bool,
    consumer_closed: bool,
}

/// An in-memory topic with a scriptable producer and a single group member.
/// The group join completes on subscribe, later rebalances are delivered from
/// within `poll`, like librdkafka does.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new(topic: &str, partitions: usize) -> Self {
        let state = ClusterState {
            topic: topic.to_owned(),
            logs: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
            default_ack: AckBehaviour::After(Duration::ZERO),
            scripted_acks: HashMap::new(),
            sends: Vec::new(),
            polls: 0,
            rebalances: HashSet::new(),
            poll_failures: HashMap::new(),
            cursors: BTreeMap::new(),
            seeks: 0,
            seek_failures: HashMap::new(),
            rebalance_error: None,
            listener: None,
            producer_closed: false,
            consumer_closed: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().expect("poisoned cluster state")
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            cluster: self.clone(),
        }
    }

    pub fn consumer(&self) -> MemoryConsumer {
        MemoryConsumer {
            cluster: self.clone(),
            corrupt_next: false,
        }
    }

    pub fn set_default_ack(&self, behaviour: AckBehaviour) {
        self.lock().default_ack = behaviour;
    }

    /// Override the answer to the `send`-th send, counting from zero.
    pub fn script_ack(&self, send: u64, behaviour: AckBehaviour) {
        self.lock().scripted_acks.insert(send, behaviour);
    }

    /// Deliver a rebalance at the start of the `poll`-th poll, counting from zero.
    pub fn rebalance_before_poll(&self, poll: u64) {
        self.lock().rebalances.insert(poll);
    }

    pub fn fail_poll(&self, poll: u64, error: KafkaError) {
        self.lock().poll_failures.insert(poll, error);
    }

    /// Reject the `seek`-th seek to end, counting from zero. The cursors stay
    /// where the assignment put them and the next poll reports the error.
    pub fn fail_seek(&self, seek: u64, error: KafkaError) {
        self.lock().seek_failures.insert(seek, error);
    }

    /// Write a record directly to a partition, returning its offset.
    pub fn append(&self, partition: i32, key: &str, value: &str) -> i64 {
        let mut state = self.lock();
        let log = &mut state.logs[partition as usize];
        log.push(Record {
            key: Some(key.to_owned()),
            value: Some(value.to_owned()),
        });
        log.len() as i64 - 1
    }

    pub fn log_end(&self, partition: i32) -> i64 {
        self.lock().logs[partition as usize].len() as i64
    }

    pub fn send_instants(&self) -> Vec<Instant> {
        self.lock().sends.clone()
    }

    pub fn producer_closed(&self) -> bool {
        self.lock().producer_closed
    }

    pub fn consumer_closed(&self) -> bool {
        self.lock().consumer_closed
    }

    fn assign_all(&self) {
        let (listener, assigned) = {
            let mut state = self.lock();
            let topic = state.topic.clone();
            let mut assigned = Vec::new();
            for partition in 0..state.logs.len() as i32 {
                // No committed offsets, start from the beginning unless moved
                state.cursors.insert(partition, 0);
                assigned.push(TopicPartition::new(&topic, partition));
            }
            (state.listener.clone(), assigned)
        };
        if let Some(listener) = listener {
            listener.on_partitions_assigned(self, &assigned);
        }
    }

    fn rebalance(&self) {
        let (listener, revoked) = {
            let mut state = self.lock();
            let topic = state.topic.clone();
            let revoked: Vec<TopicPartition> = state
                .cursors
                .keys()
                .map(|partition| TopicPartition::new(&topic, *partition))
                .collect();
            state.cursors.clear();
            (state.listener.clone(), revoked)
        };
        if let Some(listener) = listener {
            listener.on_partitions_revoked(&revoked);
        }
        self.assign_all();
    }

    fn fetch(&self) -> Vec<ConsumedMessage> {
        let mut state = self.lock();
        let state = &mut *state;
        let mut batch = Vec::new();
        for (partition, cursor) in state.cursors.iter_mut() {
            let log = &state.logs[*partition as usize];
            for (offset, record) in log.iter().enumerate().skip(*cursor as usize) {
                batch.push(ConsumedMessage {
                    topic: state.topic.clone(),
                    partition: *partition,
                    offset: offset as i64,
                    timestamp: None,
                    key: record.key.clone(),
                    value: record.value.clone(),
                });
            }
            *cursor = log.len() as i64;
        }
        batch
    }
}

impl PartitionSeeker for MemoryCluster {
    fn seek_to_end(&self, partitions: &[TopicPartition]) -> Result<(), KafkaError> {
        let mut state = self.lock();
        let seek = state.seeks;
        state.seeks += 1;
        if let Some(e) = state.seek_failures.remove(&seek) {
            state.rebalance_error = Some(e.clone());
            return Err(e);
        }
        for tp in partitions {
            let end = state.logs[tp.partition as usize].len() as i64;
            state.cursors.insert(tp.partition, end);
        }
        Ok(())
    }
}

pub struct MemoryProducer {
    cluster: MemoryCluster,
}

impl ProduceClient for MemoryProducer {
    fn send(&self, message: OutgoingMessage) -> Result<PendingAck, KafkaError> {
        let mut state = self.cluster.lock();
        let send = state.sends.len() as u64;
        state.sends.push(Instant::now());
        let behaviour = match state.scripted_acks.remove(&send) {
            Some(behaviour) => behaviour,
            None => state.default_ack.clone(),
        };

        match behaviour {
            AckBehaviour::Reject(e) => Err(e),
            AckBehaviour::Missing => Ok(async { Ok(None) }.boxed()),
            AckBehaviour::Fail(e) => Ok(async move { Err(e) }.boxed()),
            AckBehaviour::After(delay) => {
                let partition = (message.index % state.logs.len() as u64) as i32;
                let log = &mut state.logs[partition as usize];
                log.push(Record {
                    key: Some(message.key.clone()),
                    value: Some(message.value.clone()),
                });
                let ack = AckResult {
                    topic: message.topic,
                    partition,
                    offset: log.len() as i64 - 1,
                    timestamp: None,
                    serialized_key_size: message.key.len(),
                    serialized_value_size: message.value.len(),
                };
                Ok(async move {
                    tokio::time::sleep(delay).await;
                    Ok(Some(ack))
                }
                .boxed())
            }
        }
    }

    fn close(&mut self) {
        self.cluster.lock().producer_closed = true;
    }
}

pub struct MemoryConsumer {
    cluster: MemoryCluster,
    corrupt_next: bool,
}

impl MemoryConsumer {
    /// Garble the value of the next record returned by `poll`.
    pub fn corrupt_next_record(&mut self) {
        self.corrupt_next = true;
    }

    fn fetch(&mut self) -> Vec<ConsumedMessage> {
        let mut batch = self.cluster.fetch();
        if self.corrupt_next {
            if let Some(first) = batch.first_mut() {
                first.value = Some("garbled".to_string());
                self.corrupt_next = false;
            }
        }
        batch
    }
}

#[async_trait]
impl ConsumeClient for MemoryConsumer {
    fn subscribe(
        &mut self,
        _topic: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), KafkaError> {
        self.cluster.lock().listener = Some(listener);
        self.cluster.assign_all();
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedMessage>, KafkaError> {
        let (rebalance, failure) = {
            let mut state = self.cluster.lock();
            let poll = state.polls;
            state.polls += 1;
            (
                state.rebalances.remove(&poll),
                state.poll_failures.remove(&poll),
            )
        };

        if rebalance {
            self.cluster.rebalance();
        }
        if let Some(e) = self.cluster.lock().rebalance_error.take() {
            return Err(e);
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let batch = self.fetch();
        if !batch.is_empty() {
            return Ok(batch);
        }
        tokio::time::sleep(timeout).await;
        Ok(self.fetch())
    }

    fn close(&mut self) {
        self.cluster.lock().consumer_closed = true;
    }
}
