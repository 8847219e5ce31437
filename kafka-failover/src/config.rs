use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::ack::AckTimeoutPolicy;
use crate::run_loop::RunConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "9108")]
    pub port: u16,

    #[envconfig(from = "TOPIC", default = "test-basic-produce-consume")]
    pub topic: String,

    #[envconfig(default = "100")]
    pub messages_max: i64,

    #[envconfig(from = "MESSAGE_INTERVAL_MS", default = "1000")]
    pub message_interval: EnvMsDuration,

    #[envconfig(from = "ACK_TIMEOUT_MS", default = "5000")]
    pub ack_timeout: EnvMsDuration,

    #[envconfig(from = "CONSUMER_POLL_MS", default = "100")]
    pub consumer_poll: EnvMsDuration,

    #[envconfig(default = "fatal")]
    pub ack_timeout_policy: AckTimeoutPolicy,

    #[envconfig(default = "0")]
    pub duplicates_tolerated: usize,

    /// When false, keep serving metrics after the run completes until interrupted.
    #[envconfig(default = "true")]
    pub exit_on_completion: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            topic: self.topic.clone(),
            messages_max: self.messages_max,
            message_interval: self.message_interval.0,
            ack_timeout: self.ack_timeout.0,
            consumer_poll: self.consumer_poll.0,
            ack_timeout_policy: self.ack_timeout_policy,
            duplicates_tolerated: self.duplicates_tolerated,
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(from = "BOOTSTRAP", default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "kafka-failover")]
    pub kafka_consumer_group: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
    #[envconfig(default = "0")]
    pub kafka_producer_linger_ms: u32,
    #[envconfig(default = "30000")]
    pub kafka_message_timeout_ms: u32,
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
