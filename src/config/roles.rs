//! Settings for the client, server and retriever roles.

use std::time::Duration;

use serde::Deserialize;

/// How a scheduler tick disposes of the head subscription's dead letters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStrategy {
    /// Peek the dead-letter depth, then remove up to the per-iteration cap.
    #[default]
    PeekThenBatch,
    /// Receive and complete one message at a time until the view is empty.
    Drain,
}

/// Dead-letter retriever scheduling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fixed delay between the end of one tick and the start of the next.
    pub interval_secs: u64,
    /// Disposal strategy applied per tick.
    pub strategy: SweepStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            strategy: SweepStrategy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Client-side traffic generation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Messages sent per iteration.
    pub messages_per_iteration: usize,
    /// Iterations run, each with a fresh routing token and subscription.
    pub total_iterations: usize,
    /// Pause between consecutive sends, in milliseconds.
    pub send_delay_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            messages_per_iteration: 5,
            total_iterations: 1,
            send_delay_ms: 100,
        }
    }
}

impl ProducerConfig {
    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }
}

/// Server-side consumption of live subscription traffic.
///
/// Whatever the server leaves unprocessed expires into the dead-letter view.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Live messages completed per subscription.
    pub messages_to_process: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            messages_to_process: 2,
        }
    }
}
