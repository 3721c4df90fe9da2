//! Test fixtures shared by unit tests.
//!
//! Builds an in-memory broker with one topic and helpers to populate lanes
//! without going through the producer.

use std::time::Duration;

use crate::bus::{
    InMemoryBroker, ManagementClient, MessagingClient, OutgoingMessage, SubscriptionOptions,
};
use crate::config::TopicConfig;
use crate::envelope::{Envelope, EnvelopeCodec, ProstEnvelopeCodec};

pub const TEST_TOPIC: &str = "lanes-test";

/// Topic config with a short receive wait.
pub fn topic_config() -> TopicConfig {
    TopicConfig {
        receive_timeout_ms: 200,
        ..TopicConfig::for_topic(TEST_TOPIC)
    }
}

/// Topic config whose messages dead-letter one second after sending.
pub fn expiring_topic_config() -> TopicConfig {
    TopicConfig {
        message_ttl_secs: 1,
        dead_letter_on_expiration: true,
        max_delivery_count: 1,
        ..topic_config()
    }
}

pub async fn broker_with_topic(config: &TopicConfig) -> InMemoryBroker {
    let broker = InMemoryBroker::with_dead_letter_suffix(config.dead_letter_suffix.clone());
    broker.create_topic(&config.topic).await;
    broker
}

/// Create a subscription that keeps its match-all default rule.
pub async fn create_lane(broker: &InMemoryBroker, config: &TopicConfig, name: &str) {
    broker
        .create_subscription(SubscriptionOptions::for_lane(config, name))
        .await
        .unwrap();
}

/// Send `count` enveloped messages with `token` as subject; returns their ids.
pub async fn send_tokens(
    broker: &InMemoryBroker,
    config: &TopicConfig,
    token: &str,
    count: usize,
) -> Vec<String> {
    let codec = ProstEnvelopeCodec;
    let mut sender = broker.create_sender(&config.topic).await.unwrap();
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let id = format!("{token}-{i}");
        sender
            .send(OutgoingMessage {
                message_id: id.clone(),
                subject: Some(token.to_string()),
                body: codec.encode(&Envelope::new(token, format!("message {i}"))),
                time_to_live: Some(config.message_ttl()),
            })
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

/// Send messages to a lane and let them expire into its dead-letter view.
pub async fn dead_letter_tokens(
    broker: &InMemoryBroker,
    config: &TopicConfig,
    token: &str,
    count: usize,
) -> Vec<String> {
    let ids = send_tokens(broker, config, token, count).await;
    tokio::time::advance(config.message_ttl() + Duration::from_millis(100)).await;
    ids
}
