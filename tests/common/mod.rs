//! Shared fixtures for lane integration tests.
//!
//! Every fixture runs against the in-memory broker, so tests are hermetic
//! and can drive TTL and scheduling with a paused clock.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use deadlane::bus::InMemoryBroker;
use deadlane::config::{SweepStrategy, TopicConfig};
use deadlane::dlq::DrainEngine;
use deadlane::filter::FilterRuleManager;
use deadlane::inventory::SubscriptionInventory;
use deadlane::producer::{ClientSession, Producer};
use deadlane::scheduler::DeadLetterSweep;

pub const SCENARIO_TOPIC: &str = "listener-client";

/// TTL 1s, dead-letter on expiration, one delivery allowed.
pub fn scenario_config() -> TopicConfig {
    TopicConfig {
        message_ttl_secs: 1,
        dead_letter_on_expiration: true,
        max_delivery_count: 1,
        receive_timeout_ms: 200,
        ..TopicConfig::for_topic(SCENARIO_TOPIC)
    }
}

/// Broker with one topic plus constructors for every lane component.
pub struct Lanes {
    pub broker: InMemoryBroker,
    pub config: TopicConfig,
}

impl Lanes {
    pub async fn new(config: TopicConfig) -> Self {
        let broker = InMemoryBroker::with_dead_letter_suffix(config.dead_letter_suffix.clone());
        broker.create_topic(&config.topic).await;
        Self { broker, config }
    }

    fn shared(&self) -> Arc<InMemoryBroker> {
        Arc::new(self.broker.clone())
    }

    pub fn session(&self) -> ClientSession {
        ClientSession::new(
            FilterRuleManager::new(self.shared()),
            Producer::with_default_codec(self.shared(), Duration::ZERO),
        )
    }

    pub fn engine(&self) -> DrainEngine {
        DrainEngine::with_default_codec(self.shared())
    }

    pub fn inventory(&self) -> SubscriptionInventory {
        SubscriptionInventory::new(self.shared())
    }

    pub fn sweep(&self, strategy: SweepStrategy) -> DeadLetterSweep {
        DeadLetterSweep::new(
            self.config.clone(),
            self.inventory(),
            Arc::new(self.engine()),
            strategy,
        )
    }

    /// Let every message sent so far pass its TTL.
    pub async fn expire(&self) {
        tokio::time::advance(self.config.message_ttl() + Duration::from_millis(100)).await;
    }
}
