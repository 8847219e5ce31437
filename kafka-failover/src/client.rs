use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rdkafka::error::KafkaError;

use crate::message::{AckResult, ConsumedMessage, OutgoingMessage};
use crate::rebalance::RebalanceListener;

/// Resolves once the broker acknowledged (or refused) a produced message.
/// `Ok(None)` means the client gave up on the delivery report without a reason.
pub type PendingAck = BoxFuture<'static, Result<Option<AckResult>, KafkaError>>;

/// The producing half of the broker client.
pub trait ProduceClient: Send {
    /// Hand a message over to the client without waiting for the broker.
    fn send(&self, message: OutgoingMessage) -> Result<PendingAck, KafkaError>;

    /// Release the client. Safe to call more than once.
    fn close(&mut self);
}

/// The consuming half of the broker client.
#[async_trait]
pub trait ConsumeClient: Send {
    /// Subscribe to `topic`. `listener` is invoked from within `poll` whenever
    /// the partition assignment changes.
    fn subscribe(
        &mut self,
        topic: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), KafkaError>;

    /// Wait up to `timeout` for records, returning as soon as some are available.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedMessage>, KafkaError>;

    /// Release the client. Safe to call more than once.
    fn close(&mut self);
}
