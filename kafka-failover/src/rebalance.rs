use rdkafka::error::KafkaError;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: &str, partition: i32) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
        }
    }
}

/// Repositions read cursors. Handed to a `RebalanceListener` by the consumer that
/// is delivering the rebalance.
pub trait PartitionSeeker {
    /// Move the cursor of every partition to the current log end. A failure is
    /// also reported by the consumer's next poll.
    fn seek_to_end(&self, partitions: &[TopicPartition]) -> Result<(), KafkaError>;
}

/// Reacts to partition assignment changes. Invoked synchronously from within the
/// consumer's poll, so it never runs concurrently with the run loop.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_revoked(&self, partitions: &[TopicPartition]);

    fn on_partitions_assigned(&self, seeker: &dyn PartitionSeeker, partitions: &[TopicPartition]);
}

/// Discards any backlog on newly assigned partitions, so that consumption after a
/// rebalance reflects the current state of the cluster instead of catching up.
#[derive(Debug, Default)]
pub struct AlwaysSeekToEnd;

impl RebalanceListener for AlwaysSeekToEnd {
    fn on_partitions_revoked(&self, partitions: &[TopicPartition]) {
        // Nothing to commit
        info!("partitions revoked: {:?}", partitions);
    }

    fn on_partitions_assigned(&self, seeker: &dyn PartitionSeeker, partitions: &[TopicPartition]) {
        if partitions.is_empty() {
            return;
        }
        info!("seeking to end on assigned partitions: {:?}", partitions);
        // Failures show up again on the next poll
        if let Err(e) = seeker.seek_to_end(partitions) {
            error!("failed to seek to end after rebalance: {}", e);
        }
    }
}
