use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ack::{AckTimeoutPolicy, AckWaiter};
use crate::client::{ConsumeClient, ProduceClient};
use crate::error::ConsistencyFatalError;
use crate::interrupt::Interrupt;
use crate::ledger::{ConsistencyLedger, LedgerSummary};
use crate::message::OutgoingMessage;
use crate::observe::RunObserver;
use crate::rebalance::AlwaysSeekToEnd;
use crate::run_id::RunId;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub topic: String,
    /// Iterations to run, none when zero or negative.
    pub messages_max: i64,
    /// Target time between the start of two iterations.
    pub message_interval: Duration,
    pub ack_timeout: Duration,
    pub consumer_poll: Duration,
    pub ack_timeout_policy: AckTimeoutPolicy,
    pub duplicates_tolerated: usize,
}

/// What a completed run leaves behind.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    pub iterations: u64,
    pub summary: LedgerSummary,
    pub ledger: ConsistencyLedger,
}

/// Drives one run: a produce, ack wait and poll per iteration at a fixed cadence,
/// feeding the ledger with both sides.
pub struct RunLoop<P, C> {
    config: RunConfig,
    producer: P,
    consumer: C,
    observer: Arc<dyn RunObserver>,
    interrupt: Interrupt,
}

impl<P: ProduceClient, C: ConsumeClient> RunLoop<P, C> {
    pub fn new(
        config: RunConfig,
        producer: P,
        consumer: C,
        observer: Arc<dyn RunObserver>,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            config,
            producer,
            consumer,
            observer,
            interrupt,
        }
    }

    /// Run every iteration, or stop at the first fatal condition. The producer and
    /// consumer are closed before returning either way.
    pub async fn run(mut self, run_id: RunId) -> Result<RunReport, ConsistencyFatalError> {
        info!(
            "starting run {} on topic {} for {} messages",
            run_id, self.config.topic, self.config.messages_max
        );

        let mut ledger = ConsistencyLedger::new(run_id, self.config.duplicates_tolerated);
        let result = self.iterate(run_id, &mut ledger).await;

        self.producer.close();
        self.consumer.close();

        let iterations = match result {
            Ok(iterations) => iterations,
            Err(e) => {
                error!("run {} aborted: {}", run_id, e);
                return Err(e);
            }
        };

        let summary = ledger.summary();
        self.observer.summary(&summary);
        info!(
            "run {} completed {} iterations: {:?}",
            run_id, iterations, summary
        );
        ledger.verdict()?;

        Ok(RunReport {
            run_id,
            iterations,
            summary,
            ledger,
        })
    }

    async fn iterate(
        &mut self,
        run_id: RunId,
        ledger: &mut ConsistencyLedger,
    ) -> Result<u64, ConsistencyFatalError> {
        self.consumer
            .subscribe(&self.config.topic, Arc::new(AlwaysSeekToEnd))?;

        let waiter = AckWaiter::new(self.config.ack_timeout, self.config.ack_timeout_policy);
        let messages_max = u64::try_from(self.config.messages_max).unwrap_or(0);

        let mut started = Instant::now();
        for index in 0..messages_max {
            self.observer.iteration_started();

            let elapsed = started.elapsed();
            match self.config.message_interval.checked_sub(elapsed) {
                Some(wait) if !wait.is_zero() => {
                    tokio::select! {
                        biased;
                        _ = self.interrupt.raised() => {
                            error!("got interrupted waiting for iteration {}", index);
                            return Err(ConsistencyFatalError::Interrupted(
                                "waiting for the next iteration",
                            ));
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                _ => {
                    self.observer.iteration_delayed();
                    warn!(
                        "interval insufficient: iteration {} started {:?} after the previous one, target {:?}",
                        index, elapsed, self.config.message_interval
                    );
                }
            }

            started = Instant::now();
            let result = self.iteration(run_id, index, &waiter, ledger).await;
            self.observer.iteration_latency(started.elapsed());
            result?;
        }

        Ok(messages_max)
    }

    async fn iteration(
        &mut self,
        run_id: RunId,
        index: u64,
        waiter: &AckWaiter,
        ledger: &mut ConsistencyLedger,
    ) -> Result<(), ConsistencyFatalError> {
        let message = OutgoingMessage::new(&run_id, index, &self.config.topic);
        debug!("producer send: {}", message.key);

        let pending = self.producer.send(message).map_err(|source| {
            error!("failed to send message {}: {}", index, source);
            ConsistencyFatalError::SendFailed { index, source }
        })?;

        let acked = waiter
            .wait(index, pending, self.observer.as_ref(), &mut self.interrupt)
            .await?;
        if let Some(ack) = acked {
            debug!(
                "got producer ack: topic={} partition={} offset={} timestamp={:?} key_size={} value_size={}",
                ack.topic,
                ack.partition,
                ack.offset,
                ack.timestamp,
                ack.serialized_key_size,
                ack.serialized_value_size
            );
            if let Err(anomaly) = ledger.on_produced(index, ack) {
                warn!("consistency anomaly: {}", anomaly);
            }
        }

        match self.consumer.poll(self.config.consumer_poll).await {
            Ok(records) => {
                for record in records {
                    info!(
                        "consumed: offset={} timestamp={:?} key={:?} value={:?}",
                        record.offset, record.timestamp, record.key, record.value
                    );
                    ledger.on_consumed(record)?;
                }
            }
            Err(e) => {
                self.observer.poll_error();
                warn!("consumer poll failed during iteration {}: {}", index, e);
            }
        }

        Ok(())
    }
}

/// Guards a run's identity: a run id is assigned exactly once, and a run can't
/// start without one.
#[derive(Debug, Default)]
pub struct Run {
    run_id: OnceLock<RunId>,
}

impl Run {
    pub fn assign_run_id(&self, run_id: RunId) -> Result<(), ConsistencyFatalError> {
        self.run_id
            .set(run_id)
            .map_err(|_| ConsistencyFatalError::InvalidState("runs can't be reused"))
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run_id.get().copied()
    }

    pub async fn start<P: ProduceClient, C: ConsumeClient>(
        &self,
        run_loop: RunLoop<P, C>,
    ) -> Result<RunReport, ConsistencyFatalError> {
        let run_id = self
            .run_id()
            .ok_or(ConsistencyFatalError::InvalidState("a run id hasn't been assigned"))?;
        run_loop.run(run_id).await
    }
}
