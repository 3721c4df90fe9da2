//! Dead Letter Queue (DLQ) reclamation.
//!
//! Removes and reports on messages parked in a subscription's dead-letter
//! view, or on the live queue for server-side processing.
//!
//! ## Entity Paths
//!
//! A dead-letter view is addressed as `{subscription}{dead_letter_suffix}`,
//! e.g. `a1b2c3d4/$DeadLetterQueue`.
//!
//! ## Termination
//!
//! The transport has no "queue empty" signal. A drain pass ends when a
//! bounded receive comes back with nothing, so `receive_timeout_ms` trades
//! drain latency against leaving a late arrival for the next pass.
//!
//! ## Settlement
//!
//! Delivery count and dead-letter reason are reported, never acted on.
//! Whether a message is removed or released is decided by the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::{
    BusError, MessageReceiver, MessagingClient, ReceiveMode, ReceivedMessage, ReceiverOptions,
};
use crate::config::TopicConfig;
use crate::envelope::{EnvelopeCodec, ProstEnvelopeCodec};

/// Characters of decoded payload kept in a drained entry.
pub const PAYLOAD_SUMMARY_CHARS: usize = 80;

/// Summary reported for bodies the codec cannot read.
pub const UNDECODABLE_PAYLOAD: &str = "<undecodable payload>";

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Subscription not found: {0}")]
    EntityNotFound(String),

    #[error("Invalid subscription name: {0:?}")]
    InvalidSubscription(String),

    #[error("Transport error: {0}")]
    Transport(BusError),
}

impl DlqError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DlqError::EntityNotFound(_))
    }
}

impl From<BusError> for DlqError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::EntityNotFound(entity) => DlqError::EntityNotFound(entity),
            other => DlqError::Transport(other),
        }
    }
}

/// Queue of a subscription to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueView {
    DeadLetter,
    Live,
}

impl QueueView {
    pub fn entity_path(self, config: &TopicConfig, subscription: &str) -> String {
        match self {
            QueueView::DeadLetter => config.dead_letter_path(subscription),
            QueueView::Live => subscription.to_string(),
        }
    }
}

/// Report for one message taken off a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainedEntry {
    pub message_id: String,
    /// Routing token from the envelope, or the message subject if the body
    /// could not be decoded.
    pub session_token: String,
    pub subject: Option<String>,
    pub delivery_count: u32,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
    pub payload_summary: String,
}

impl DrainedEntry {
    fn from_message(message: &ReceivedMessage, codec: &dyn EnvelopeCodec) -> Self {
        let (session_token, payload_summary) = match codec.decode(&message.body) {
            Ok(envelope) => {
                let summary = envelope.summary(PAYLOAD_SUMMARY_CHARS);
                (envelope.session_token, summary)
            }
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Undecodable message body");
                (
                    message.subject.clone().unwrap_or_default(),
                    UNDECODABLE_PAYLOAD.to_string(),
                )
            }
        };
        Self {
            message_id: message.message_id.clone(),
            session_token,
            subject: message.subject.clone(),
            delivery_count: message.delivery_count,
            dead_letter_reason: message.dead_letter_reason.clone(),
            dead_letter_description: message.dead_letter_description.clone(),
            payload_summary,
        }
    }

    /// Log line for the `ordinal`-th entry of a pass: `007 - [description] - reason`.
    pub fn log_line(&self, ordinal: usize) -> String {
        format!(
            "{:03} - [{}] - {}",
            ordinal,
            self.dead_letter_description.as_deref().unwrap_or("-"),
            self.dead_letter_reason.as_deref().unwrap_or("-"),
        )
    }
}

/// Outcome of a full drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainResult {
    pub count: usize,
    pub entries: Vec<DrainedEntry>,
}

/// Capability for disposing of queued messages.
#[async_trait]
pub trait DeadLetterQueueProcessor: Send + Sync {
    /// Receive and complete dead letters one at a time until a receive
    /// times out empty.
    async fn drain(&self, config: &TopicConfig, subscription: &str)
        -> Result<DrainResult, DlqError>;

    /// Receive up to `max_count` messages in one call, then complete them
    /// (`remove`) or release them back to the queue (a peek).
    async fn process_batch(
        &self,
        config: &TopicConfig,
        subscription: &str,
        view: QueueView,
        max_count: usize,
        remove: bool,
    ) -> Result<Vec<DrainedEntry>, DlqError>;
}

/// Transport-backed processor.
pub struct DrainEngine {
    messaging: Arc<dyn MessagingClient>,
    codec: Arc<dyn EnvelopeCodec>,
}

impl DrainEngine {
    pub fn new(messaging: Arc<dyn MessagingClient>, codec: Arc<dyn EnvelopeCodec>) -> Self {
        Self { messaging, codec }
    }

    /// Engine decoding bodies with [`ProstEnvelopeCodec`].
    pub fn with_default_codec(messaging: Arc<dyn MessagingClient>) -> Self {
        Self::new(messaging, Arc::new(ProstEnvelopeCodec))
    }

    async fn open(
        &self,
        config: &TopicConfig,
        subscription: &str,
        view: QueueView,
        options: ReceiverOptions,
    ) -> Result<Box<dyn MessageReceiver>, DlqError> {
        validate_subscription(subscription)?;
        let path = view.entity_path(config, subscription);
        Ok(self
            .messaging
            .create_receiver(&config.topic, &path, options)
            .await?)
    }

    async fn drain_with(
        &self,
        receiver: &mut dyn MessageReceiver,
        timeout: Duration,
    ) -> Result<Vec<DrainedEntry>, DlqError> {
        let mut entries = Vec::new();
        while let Some(message) = receiver.receive_one(timeout).await? {
            let entry = DrainedEntry::from_message(&message, self.codec.as_ref());
            match receiver.complete(&message).await {
                Ok(()) => {
                    info!("{}", entry.log_line(entries.len() + 1));
                    entries.push(entry);
                }
                Err(BusError::LockLost(id)) => {
                    warn!(message_id = %id, "Lock lost before completion, message stays queued");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }

    async fn settle_batch(
        &self,
        receiver: &mut dyn MessageReceiver,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<DrainedEntry>, DlqError> {
        let messages = receiver.receive_batch(max_count, timeout).await?;
        let mut entries = Vec::with_capacity(messages.len());
        for message in messages.into_iter().take(max_count) {
            let entry = DrainedEntry::from_message(&message, self.codec.as_ref());
            let settled = match receiver.mode() {
                ReceiveMode::LockThenComplete => receiver.complete(&message).await,
                ReceiveMode::LockThenRelease => receiver.abandon(&message).await,
            };
            match settled {
                Ok(()) => entries.push(entry),
                Err(BusError::LockLost(id)) => {
                    warn!(message_id = %id, "Lock lost before settlement");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl DeadLetterQueueProcessor for DrainEngine {
    #[tracing::instrument(name = "dlq.drain", skip_all, fields(subscription = %subscription))]
    async fn drain(
        &self,
        config: &TopicConfig,
        subscription: &str,
    ) -> Result<DrainResult, DlqError> {
        let options = ReceiverOptions {
            prefetch_count: 0,
            mode: ReceiveMode::LockThenComplete,
        };
        let mut receiver = self
            .open(config, subscription, QueueView::DeadLetter, options)
            .await?;
        let outcome = self
            .drain_with(receiver.as_mut(), config.receive_timeout())
            .await;
        close_receiver(receiver.as_mut()).await;

        let entries = outcome?;
        info!(count = entries.len(), "Dead-letter drain finished");
        Ok(DrainResult {
            count: entries.len(),
            entries,
        })
    }

    #[tracing::instrument(
        name = "dlq.process_batch",
        skip_all,
        fields(subscription = %subscription, view = ?view, max_count = max_count, remove = remove)
    )]
    async fn process_batch(
        &self,
        config: &TopicConfig,
        subscription: &str,
        view: QueueView,
        max_count: usize,
        remove: bool,
    ) -> Result<Vec<DrainedEntry>, DlqError> {
        if max_count == 0 {
            validate_subscription(subscription)?;
            return Ok(Vec::new());
        }
        let options = ReceiverOptions {
            prefetch_count: u32::try_from(max_count).unwrap_or(u32::MAX),
            mode: if remove {
                ReceiveMode::LockThenComplete
            } else {
                ReceiveMode::LockThenRelease
            },
        };
        let mut receiver = self.open(config, subscription, view, options).await?;
        let outcome = self
            .settle_batch(receiver.as_mut(), max_count, config.receive_timeout())
            .await;
        close_receiver(receiver.as_mut()).await;

        let entries = outcome?;
        debug!(count = entries.len(), "Batch processed");
        Ok(entries)
    }
}

/// Remove up to `per_subscription` live messages from each subscription.
///
/// Whatever is left expires into the dead-letter views. Per-subscription
/// failures are logged and skipped. Returns the number of messages removed.
pub async fn process_live_subscriptions(
    processor: &dyn DeadLetterQueueProcessor,
    config: &TopicConfig,
    subscriptions: &[String],
    per_subscription: usize,
) -> usize {
    let mut processed = 0;
    for name in subscriptions {
        match processor
            .process_batch(config, name, QueueView::Live, per_subscription, true)
            .await
        {
            Ok(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    info!(
                        subscription = %name,
                        message_id = %entry.message_id,
                        token = %entry.session_token,
                        payload = %entry.payload_summary,
                        "{:03} - processed",
                        i + 1
                    );
                }
                processed += entries.len();
            }
            Err(e) if e.is_not_found() => {
                debug!(subscription = %name, "Subscription vanished before processing");
            }
            Err(e) => {
                warn!(subscription = %name, error = %e, "Live processing failed");
            }
        }
    }
    processed
}

fn validate_subscription(subscription: &str) -> Result<(), DlqError> {
    if subscription.is_empty() || subscription.contains('/') {
        return Err(DlqError::InvalidSubscription(subscription.to_string()));
    }
    Ok(())
}

async fn close_receiver(receiver: &mut dyn MessageReceiver) {
    if let Err(e) = receiver.close().await {
        debug!(error = %e, "Receiver close failed");
    }
}
