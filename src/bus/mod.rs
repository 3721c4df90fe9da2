//! Topic collaborators for subscription lanes.
//!
//! This module contains:
//! - `ManagementClient` trait: topic/subscription/rule administration
//! - `MessagingClient` trait: receivers and senders bound to a topic
//! - Option, status and message types shared by both
//! - Implementations: in-memory topic broker (`memory`)

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::TopicConfig;

pub mod memory;

pub use memory::InMemoryBroker;

/// Name of the match-all rule every subscription starts with.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Suffix addressing a subscription's dead-letter view.
pub const DEAD_LETTER_SUFFIX: &str = "/$DeadLetterQueue";

/// Dead-letter reason for messages whose time-to-live elapsed.
pub const REASON_TTL_EXPIRED: &str = "TTLExpiredException";

/// Dead-letter reason for messages delivered too many times.
pub const REASON_MAX_DELIVERY: &str = "MaxDeliveryCountExceeded";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors reported by the management API or the messaging transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Messaging entity not found: {0}")]
    EntityNotFound(String),

    #[error("Messaging entity already exists: {0}")]
    EntityAlreadyExists(String),

    #[error("Message lock lost: {0}")]
    LockLost(String),

    #[error("Transient transport failure: {0}")]
    Transient(String),

    #[error("Management operation failed: {0}")]
    Management(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),
}

impl BusError {
    /// The addressed topic, subscription or rule no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BusError::EntityNotFound(_))
    }

    /// A retry may succeed without any change on the caller's side.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transient(_))
    }
}

// ============================================================================
// Management types
// ============================================================================

/// Lifecycle status reported for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Active,
    Creating,
    Disabled,
    ReceiveDisabled,
}

/// Options for creating a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub topic: String,
    pub name: String,
    pub auto_delete_on_idle: Duration,
    pub default_message_ttl: Duration,
    pub lock_duration: Duration,
    pub dead_letter_on_expiration: bool,
    pub max_delivery_count: u32,
}

impl SubscriptionOptions {
    /// Options for an ephemeral lane subscription under the configured topic.
    pub fn for_lane(config: &TopicConfig, name: impl Into<String>) -> Self {
        Self {
            topic: config.topic.clone(),
            name: name.into(),
            auto_delete_on_idle: config.auto_delete_on_idle(),
            default_message_ttl: config.message_ttl(),
            lock_duration: config.lock_duration(),
            dead_letter_on_expiration: config.dead_letter_on_expiration,
            max_delivery_count: config.max_delivery_count,
        }
    }
}

/// Subscription as reported by the management API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionProperties {
    pub topic: String,
    pub name: String,
    pub status: EntityStatus,
}

/// Correlation predicate matched against a message's subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationFilter {
    pub subject: String,
}

/// Predicate attached to a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleFilter {
    /// Matches every message.
    True,
    Correlation(CorrelationFilter),
}

/// Named routing rule on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDescription {
    pub name: String,
    pub filter: RuleFilter,
}

impl RuleDescription {
    /// The match-all rule a subscription is created with.
    pub fn default_rule() -> Self {
        Self {
            name: DEFAULT_RULE_NAME.to_string(),
            filter: RuleFilter::True,
        }
    }

    /// A correlation rule admitting messages whose subject equals `subject`.
    pub fn correlation(name: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: RuleFilter::Correlation(CorrelationFilter {
                subject: subject.into(),
            }),
        }
    }

    /// Check whether a message with this subject passes the rule.
    pub fn matches(&self, subject: Option<&str>) -> bool {
        match &self.filter {
            RuleFilter::True => true,
            RuleFilter::Correlation(filter) => subject == Some(filter.subject.as_str()),
        }
    }
}

// ============================================================================
// Messaging types
// ============================================================================

/// Settlement applied by the holder of a peek-locked message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Lock on receive, then complete (remove permanently).
    #[default]
    LockThenComplete,
    /// Lock on receive, then release the lock (message stays queued).
    LockThenRelease,
}

/// Options for creating a receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverOptions {
    pub prefetch_count: u32,
    pub mode: ReceiveMode,
}

/// Message handed to a sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: String,
    /// Routing subject, matched by correlation rules.
    pub subject: Option<String>,
    pub body: Bytes,
    pub time_to_live: Option<Duration>,
}

/// Peek-locked message handed out by a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub subject: Option<String>,
    pub body: Bytes,
    pub delivery_count: u32,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub sequence_number: u64,
    pub lock_token: Uuid,
}

// ============================================================================
// Traits
// ============================================================================

/// Administrative API for a topic's subscriptions and rules.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// List one page of subscriptions, ordered by name.
    async fn list_subscriptions(
        &self,
        topic: &str,
        page_size: usize,
        skip: usize,
    ) -> Result<Vec<SubscriptionProperties>>;

    async fn subscription_exists(&self, topic: &str, name: &str) -> Result<bool>;

    /// Create a subscription. New subscriptions carry the `$Default` rule.
    async fn create_subscription(
        &self,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionProperties>;

    async fn create_rule(&self, topic: &str, subscription: &str, rule: RuleDescription)
        -> Result<()>;

    async fn delete_rule(&self, topic: &str, subscription: &str, name: &str) -> Result<()>;

    async fn rule_exists(&self, topic: &str, subscription: &str, name: &str) -> Result<bool>;

    async fn list_rules(&self, topic: &str, subscription: &str) -> Result<Vec<RuleDescription>>;
}

/// Transport factory for receivers and senders.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Open a receiver on a subscription entity path.
    ///
    /// The path is a subscription name, optionally followed by the
    /// dead-letter suffix. A missing entity is reported on receive.
    async fn create_receiver(
        &self,
        topic: &str,
        entity_path: &str,
        options: ReceiverOptions,
    ) -> Result<Box<dyn MessageReceiver>>;

    async fn create_sender(&self, topic: &str) -> Result<Box<dyn MessageSender>>;
}

/// Peek-lock receiver bound to one entity path.
#[async_trait]
pub trait MessageReceiver: Send {
    /// Settlement mode this receiver was opened with.
    fn mode(&self) -> ReceiveMode;

    /// Wait up to `timeout` for the next message.
    async fn receive_one(&mut self, timeout: Duration) -> Result<Option<ReceivedMessage>>;

    /// Wait up to `timeout` for at least one message, returning at most `max`.
    async fn receive_batch(&mut self, max: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>>;

    /// Permanently remove a locked message.
    async fn complete(&mut self, message: &ReceivedMessage) -> Result<()>;

    /// Release a locked message back to its queue.
    async fn abandon(&mut self, message: &ReceivedMessage) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Sender bound to one topic.
#[async_trait]
pub trait MessageSender: Send {
    async fn send(&mut self, message: OutgoingMessage) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
