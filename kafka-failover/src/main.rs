//! Produce and consume a paced sequence of messages against a Kafka cluster
//! undergoing failover, then report what was lost, duplicated or reordered.
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kafka_failover::config::Config;
use kafka_failover::error::ConsistencyFatalError;
use kafka_failover::interrupt::{self, InterruptTrigger};
use kafka_failover::kafka::{KafkaConsumer, KafkaProducer};
use kafka_failover::metrics::{serve, setup_metrics_router};
use kafka_failover::observe::{register_metrics, PrometheusObserver};
use kafka_failover::run_id::RunId;
use kafka_failover::run_loop::{Run, RunLoop};

async fn interrupt_on_ctrl_c(trigger: InterruptTrigger) {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("received interrupt, stopping the run");
            trigger.raise();
        }
        Err(e) => error!("failed to listen for interrupts: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), ConsistencyFatalError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let router = setup_metrics_router().expect("failed to install metrics recorder");
    register_metrics();
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let (trigger, interrupt) = interrupt::channel();
    tokio::task::spawn(interrupt_on_ctrl_c(trigger));

    let producer = KafkaProducer::new(&config.kafka)?;
    let consumer = KafkaConsumer::new(&config.kafka)?;

    let run = Run::default();
    run.assign_run_id(RunId::new())?;

    let run_loop = RunLoop::new(
        config.run_config(),
        producer,
        consumer,
        Arc::new(PrometheusObserver),
        interrupt.clone(),
    );
    let report = run.start(run_loop).await?;

    info!(
        "run {} verified: {} produced, {} consumed, {} matched, {} lost, {} duplicated, {} acked twice, {} unmatched, {} reordered",
        report.run_id,
        report.summary.produced,
        report.summary.consumed,
        report.summary.matched,
        report.summary.lost,
        report.summary.duplicates,
        report.summary.duplicate_acks,
        report.summary.unmatched,
        report.summary.reordered
    );
    for index in report.ledger.lost() {
        info!("lost message {}", index);
    }

    if !config.exit_on_completion {
        info!("run complete, serving metrics until interrupted");
        let mut interrupt = interrupt;
        interrupt.raised().await;
    }

    Ok(())
}
