use std::cell::RefCell;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::gauge;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, RebalanceProtocol, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::types::RDKafkaRespErr;
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::{ConsumeClient, PendingAck, ProduceClient};
use crate::config::KafkaConfig;
use crate::message::{AckResult, ConsumedMessage, OutgoingMessage};
use crate::rebalance::{PartitionSeeker, RebalanceListener, TopicPartition};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

type AckSender = oneshot::Sender<Result<AckResult, KafkaError>>;

pub struct FailoverProducerContext;

impl ClientContext for FailoverProducerContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        for (_, stats) in stats.brokers {
            gauge!(
                "kafka_broker_requests_pending",
                "broker" => stats.nodeid.to_string()
            )
            .set(stats.outbuf_cnt as f64);
        }
    }
}

impl ProducerContext for FailoverProducerContext {
    type DeliveryOpaque = Box<AckSender>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, sender: Self::DeliveryOpaque) {
        let outcome = match delivery_result {
            Ok(message) => Ok(ack_from(message)),
            Err((e, _)) => Err(e.clone()),
        };
        if (*sender).send(outcome).is_err() {
            debug!("delivery report arrived after the ack wait was abandoned");
        }
    }
}

fn ack_from(message: &BorrowedMessage<'_>) -> AckResult {
    AckResult {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message.timestamp().to_millis(),
        serialized_key_size: message.key().map_or(0, <[u8]>::len),
        serialized_value_size: message.payload().map_or(0, <[u8]>::len),
    }
}

/// Produces through librdkafka, resolving each send's `PendingAck` from the
/// delivery report callback.
pub struct KafkaProducer {
    producer: ThreadedProducer<FailoverProducerContext>,
    closed: bool,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        info!("connecting producer to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = client_config(config);
        client_config
            .set("acks", "all")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            );

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: ThreadedProducer<FailoverProducerContext> =
            client_config.create_with_context(FailoverProducerContext)?;

        Ok(Self {
            producer,
            closed: false,
        })
    }
}

impl ProduceClient for KafkaProducer {
    fn send(&self, message: OutgoingMessage) -> Result<PendingAck, KafkaError> {
        let (sender, receiver) = oneshot::channel();
        let record = BaseRecord::with_opaque_to(&message.topic, Box::new(sender))
            .key(message.key.as_str())
            .payload(message.value.as_str());

        self.producer.send(record).map_err(|(e, _)| e)?;

        Ok(async move {
            match receiver.await {
                Ok(Ok(ack)) => Ok(Some(ack)),
                Ok(Err(e)) => Err(e),
                // The client dropped the delivery report
                Err(_) => Ok(None),
            }
        }
        .boxed())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.producer.flush(FLUSH_TIMEOUT) {
            warn!("failed to flush producer on close: {}", e);
        }
    }
}

impl Drop for KafkaProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Delivers rebalances to the subscribed `RebalanceListener` and applies the
/// positions it asks for to the assignment before librdkafka starts fetching.
/// Callbacks run on the task polling the consumer.
#[derive(Default)]
pub struct FailoverConsumerContext {
    listener: Mutex<Option<Arc<dyn RebalanceListener>>>,
    rebalance_error: Mutex<Option<KafkaError>>,
}

impl FailoverConsumerContext {
    fn set_listener(&self, listener: Arc<dyn RebalanceListener>) {
        match self.listener.lock() {
            Ok(mut current) => *current = Some(listener),
            Err(_) => warn!("poisoned rebalance listener mutex"),
        }
    }

    fn listener(&self) -> Option<Arc<dyn RebalanceListener>> {
        self.listener.lock().ok().and_then(|listener| listener.clone())
    }

    /// Keep the first failure until the next poll picks it up.
    fn stash_error(&self, error: KafkaError) {
        match self.rebalance_error.lock() {
            Ok(mut current) => {
                if current.is_none() {
                    *current = Some(error);
                }
            }
            Err(_) => warn!("poisoned rebalance error mutex"),
        }
    }

    fn take_rebalance_error(&self) -> Option<KafkaError> {
        self.rebalance_error
            .lock()
            .ok()
            .and_then(|mut error| error.take())
    }
}

impl ClientContext for FailoverConsumerContext {}

impl ConsumerContext for FailoverConsumerContext {
    fn rebalance(
        &self,
        base_consumer: &BaseConsumer<Self>,
        err: RDKafkaRespErr,
        tpl: &mut TopicPartitionList,
    ) {
        let listener = self.listener();
        let result = match err {
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS => {
                let partitions = topic_partitions(tpl);
                if let Some(listener) = &listener {
                    let seeker = AssignmentSeeker::new(tpl);
                    listener.on_partitions_assigned(&seeker, &partitions);
                    if let Some(e) = seeker.into_failure() {
                        self.stash_error(e);
                    }
                }
                assign(base_consumer, tpl)
            }
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS => {
                if let Some(listener) = &listener {
                    listener.on_partitions_revoked(&topic_partitions(tpl));
                }
                unassign(base_consumer, tpl)
            }
            _ => Err(KafkaError::Rebalance(err.into())),
        };

        if let Err(e) = result {
            warn!("rebalance failed: {}", e);
            self.stash_error(e);
        }
    }
}

fn assign(
    consumer: &BaseConsumer<FailoverConsumerContext>,
    tpl: &TopicPartitionList,
) -> KafkaResult<()> {
    match consumer.rebalance_protocol() {
        RebalanceProtocol::Cooperative => consumer.incremental_assign(tpl),
        _ => consumer.assign(tpl),
    }
}

fn unassign(
    consumer: &BaseConsumer<FailoverConsumerContext>,
    tpl: &TopicPartitionList,
) -> KafkaResult<()> {
    match consumer.rebalance_protocol() {
        RebalanceProtocol::Cooperative => consumer.incremental_unassign(tpl),
        _ => consumer.unassign(),
    }
}

fn topic_partitions(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

/// Seeks by rewriting the start offsets of an assignment that hasn't been handed
/// to librdkafka yet. A seek on a partition whose fetcher hasn't started is
/// rejected with an erroneous state, so seeking after the assign doesn't work.
struct AssignmentSeeker<'a> {
    assignment: RefCell<&'a mut TopicPartitionList>,
    failure: RefCell<Option<KafkaError>>,
}

impl<'a> AssignmentSeeker<'a> {
    fn new(assignment: &'a mut TopicPartitionList) -> Self {
        Self {
            assignment: RefCell::new(assignment),
            failure: RefCell::new(None),
        }
    }

    fn into_failure(self) -> Option<KafkaError> {
        self.failure.into_inner()
    }
}

impl PartitionSeeker for AssignmentSeeker<'_> {
    fn seek_to_end(&self, partitions: &[TopicPartition]) -> Result<(), KafkaError> {
        let mut assignment = self.assignment.borrow_mut();
        let mut result = Ok(());
        for tp in partitions {
            let seeked = assignment.set_partition_offset(&tp.topic, tp.partition, Offset::End);
            if let Err(e) = seeked {
                warn!("failed to seek {}:{} to end: {}", tp.topic, tp.partition, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        if let Err(e) = &result {
            let mut failure = self.failure.borrow_mut();
            if failure.is_none() {
                *failure = Some(e.clone());
            }
        }
        result
    }
}

/// Consumes through librdkafka. Offsets are never committed, every assignment
/// starts wherever the rebalance listener puts it.
pub struct KafkaConsumer {
    consumer: StreamConsumer<FailoverConsumerContext>,
    closed: bool,
}

impl KafkaConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        info!("connecting consumer to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = client_config(config);
        client_config
            .set("group.id", &config.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set("enable.partition.eof", "false");

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer<FailoverConsumerContext> =
            client_config.create_with_context(FailoverConsumerContext::default())?;

        Ok(Self {
            consumer,
            closed: false,
        })
    }
}

fn consumed_from(message: &BorrowedMessage<'_>) -> ConsumedMessage {
    ConsumedMessage {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message.timestamp().to_millis(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        value: message
            .payload()
            .map(|value| String::from_utf8_lossy(value).into_owned()),
    }
}

#[async_trait]
impl ConsumeClient for KafkaConsumer {
    fn subscribe(
        &mut self,
        topic: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), KafkaError> {
        self.consumer.context().set_listener(listener);
        self.consumer.subscribe(&[topic])
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedMessage>, KafkaError> {
        if let Some(e) = self.consumer.context().take_rebalance_error() {
            return Err(e);
        }

        let mut batch = Vec::new();
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => {}
            Ok(Err(e)) => return Err(e),
            Ok(Ok(message)) => batch.push(consumed_from(&message)),
        }

        // Drain whatever else is already buffered
        if !batch.is_empty() {
            while let Some(result) = self.consumer.recv().now_or_never() {
                match result {
                    Ok(message) => batch.push(consumed_from(&message)),
                    Err(e) => {
                        warn!("consumer error while draining poll: {}", e);
                        break;
                    }
                }
            }
        }

        // A rebalance failing within this poll is reported now unless records
        // arrived, then it waits for the next poll.
        if batch.is_empty() {
            if let Some(e) = self.consumer.context().take_rebalance_error() {
                return Err(e);
            }
        }
        Ok(batch)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.consumer.unsubscribe();
    }
}

impl Drop for KafkaConsumer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::types::RDKafkaErrorCode;

    use super::*;

    #[test]
    fn seek_to_end_rewrites_the_pending_assignment() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset("failover", 0, Offset::Stored).unwrap();
        tpl.add_partition_offset("failover", 1, Offset::Offset(3)).unwrap();

        let seeker = AssignmentSeeker::new(&mut tpl);
        seeker
            .seek_to_end(&[
                TopicPartition::new("failover", 0),
                TopicPartition::new("failover", 1),
            ])
            .unwrap();
        assert!(seeker.into_failure().is_none());

        for partition in [0, 1] {
            let elem = tpl.find_partition("failover", partition).unwrap();
            assert_eq!(elem.offset(), Offset::End);
        }
    }

    #[test]
    fn seek_outside_the_assignment_is_kept_as_failure() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset("failover", 0, Offset::Stored).unwrap();

        let seeker = AssignmentSeeker::new(&mut tpl);
        let result = seeker.seek_to_end(&[
            TopicPartition::new("failover", 0),
            TopicPartition::new("failover", 7),
        ]);

        assert!(result.is_err());
        assert!(matches!(
            seeker.into_failure(),
            Some(KafkaError::SetPartitionOffset(_))
        ));
        // Partitions that could be moved still are
        let elem = tpl.find_partition("failover", 0).unwrap();
        assert_eq!(elem.offset(), Offset::End);
    }

    #[test]
    fn rebalance_errors_are_taken_once() {
        let context = FailoverConsumerContext::default();
        context.stash_error(KafkaError::Rebalance(RDKafkaErrorCode::Fail));
        context.stash_error(KafkaError::Seek("later".to_string()));

        assert!(matches!(
            context.take_rebalance_error(),
            Some(KafkaError::Rebalance(RDKafkaErrorCode::Fail))
        ));
        assert!(context.take_rebalance_error().is_none());
    }
}
