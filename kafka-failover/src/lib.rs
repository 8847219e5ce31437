pub mod ack;
pub mod client;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod kafka;
pub mod ledger;
pub mod message;
pub mod metrics;
pub mod observe;
pub mod rebalance;
pub mod run_id;
pub mod run_loop;

#[cfg(test)]
mod test_utils;
