//! Topic and subscription settings consumed by every lane component.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::bus::DEAD_LETTER_SUFFIX;

/// Default topic name when none is configured.
pub const DEFAULT_TOPIC: &str = "deadlane-topic";

/// Settings for one topic and the ephemeral subscriptions created under it.
///
/// Treated as an immutable snapshot per operation: components borrow it and
/// never mutate it, except the client iteration runner which records the
/// last routing token it minted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Transport connection string (opaque to this crate).
    pub connection_string: String,
    /// Management connection string (opaque to this crate).
    pub management_connection_string: String,
    /// Topic name.
    pub topic: String,
    /// Suffix appended to a subscription name to address its dead-letter view.
    pub dead_letter_suffix: String,
    /// Default message time-to-live for created subscriptions, in seconds.
    pub message_ttl_secs: u64,
    /// Idle window after which a created subscription is removed, in minutes.
    pub auto_delete_on_idle_mins: u64,
    /// Peek-lock duration for created subscriptions, in seconds.
    pub lock_duration_secs: u64,
    /// Deliveries allowed before the broker dead-letters a message.
    pub max_delivery_count: u32,
    /// Legacy key that historically configured the delivery count despite its
    /// name. Folded into `max_delivery_count` by [`TopicConfig::normalize`].
    #[serde(rename = "subscription_max_delivery_time")]
    pub legacy_max_delivery_time: Option<u32>,
    /// Whether expired messages move to the dead-letter view.
    pub dead_letter_on_expiration: bool,
    /// Upper bound on messages handled per scheduler tick.
    pub max_messages_per_iteration: usize,
    /// Routing token most recently installed by a client session.
    pub last_routing_token: Option<String>,
    /// Bounded wait for a single receive, in milliseconds.
    pub receive_timeout_ms: u64,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            management_connection_string: String::new(),
            topic: DEFAULT_TOPIC.to_string(),
            dead_letter_suffix: DEAD_LETTER_SUFFIX.to_string(),
            message_ttl_secs: 30,
            auto_delete_on_idle_mins: 30,
            lock_duration_secs: 30,
            max_delivery_count: 10,
            legacy_max_delivery_time: None,
            dead_letter_on_expiration: false,
            max_messages_per_iteration: 10,
            last_routing_token: None,
            receive_timeout_ms: 500,
        }
    }
}

impl TopicConfig {
    /// Config for a named topic with default settings.
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Apply the legacy delivery key, if present, and clamp the sweep cap.
    ///
    /// The old key was named for a delivery *time* but always configured the
    /// delivery *count*. It is honored as a count and flagged. A zero
    /// per-iteration cap would make every sweep read nothing, so it is
    /// raised to 1.
    pub fn normalize(&mut self) {
        if let Some(legacy) = self.legacy_max_delivery_time.take() {
            warn!(
                subscription_max_delivery_time = legacy,
                max_delivery_count = self.max_delivery_count,
                "subscription_max_delivery_time configures the max delivery count, not a time; \
                 use max_delivery_count instead"
            );
            self.max_delivery_count = legacy;
        }
        if self.max_messages_per_iteration == 0 {
            warn!("max_messages_per_iteration must be at least 1; using 1");
            self.max_messages_per_iteration = 1;
        }
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    pub fn auto_delete_on_idle(&self) -> Duration {
        Duration::from_secs(self.auto_delete_on_idle_mins.saturating_mul(60))
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Entity path of a subscription's dead-letter view.
    pub fn dead_letter_path(&self, subscription: &str) -> String {
        format!("{}{}", subscription, self.dead_letter_suffix)
    }
}
