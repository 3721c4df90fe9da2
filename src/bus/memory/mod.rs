//! In-memory topic broker for standalone mode and tests.
//!
//! Emulates the broker behavior lanes rely on within a single process:
//! rule-filtered fan-out, peek-lock settlement, TTL and delivery-count
//! dead-lettering, and auto-delete of idle subscriptions.
//!
//! Expiry is applied lazily whenever a topic is touched. All timing uses
//! `tokio::time`, so paused-clock tests are deterministic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BusError, EntityStatus, ManagementClient, MessageReceiver, MessageSender, MessagingClient,
    OutgoingMessage, ReceiveMode, ReceivedMessage, ReceiverOptions, Result, RuleDescription,
    SubscriptionOptions, SubscriptionProperties, DEAD_LETTER_SUFFIX, REASON_MAX_DELIVERY,
    REASON_TTL_EXPIRED,
};

/// Which queue of a subscription an entity path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Live,
    DeadLetter,
}

/// Split an entity path into subscription name and view.
///
/// The dead-letter suffix is matched case-insensitively.
fn parse_entity_path<'a>(path: &'a str, dead_letter_suffix: &str) -> (&'a str, View) {
    let suffix = dead_letter_suffix.len();
    if suffix > 0
        && path.len() >= suffix
        && path.is_char_boundary(path.len() - suffix)
        && path[path.len() - suffix..].eq_ignore_ascii_case(dead_letter_suffix)
    {
        (&path[..path.len() - suffix], View::DeadLetter)
    } else {
        (path, View::Live)
    }
}

/// Decrement a one-shot failure counter, reporting whether it fired.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: ReceivedMessage,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct LockedMessage {
    view: View,
    stored: StoredMessage,
    locked_until: Instant,
}

#[derive(Debug)]
struct SubscriptionState {
    options: SubscriptionOptions,
    status: EntityStatus,
    rules: Vec<RuleDescription>,
    active: VecDeque<StoredMessage>,
    dead_letter: VecDeque<StoredMessage>,
    locked: HashMap<Uuid, LockedMessage>,
    last_activity: Instant,
}

impl SubscriptionState {
    fn new(options: SubscriptionOptions, status: EntityStatus, now: Instant) -> Self {
        Self {
            options,
            status,
            rules: vec![RuleDescription::default_rule()],
            active: VecDeque::new(),
            dead_letter: VecDeque::new(),
            locked: HashMap::new(),
            last_activity: now,
        }
    }

    fn properties(&self) -> SubscriptionProperties {
        SubscriptionProperties {
            topic: self.options.topic.clone(),
            name: self.options.name.clone(),
            status: self.status,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    fn is_idle(&self, now: Instant) -> bool {
        let window = self.options.auto_delete_on_idle;
        !window.is_zero() && now.saturating_duration_since(self.last_activity) >= window
    }

    fn queue_mut(&mut self, view: View) -> &mut VecDeque<StoredMessage> {
        match view {
            View::Live => &mut self.active,
            View::DeadLetter => &mut self.dead_letter,
        }
    }

    /// Put a message back in sequence order.
    fn requeue(&mut self, view: View, stored: StoredMessage) {
        let queue = self.queue_mut(view);
        let sequence = stored.message.sequence_number;
        let at = queue.partition_point(|m| m.message.sequence_number <= sequence);
        queue.insert(at, stored);
    }

    fn dead_letter(&mut self, mut stored: StoredMessage, reason: &str, description: String) {
        stored.message.dead_letter_reason = Some(reason.to_string());
        stored.message.dead_letter_description = Some(description);
        stored.expires_at = None;
        self.requeue(View::DeadLetter, stored);
    }

    /// Release a lock, as on abandon or lock expiry.
    fn release(&mut self, locked: LockedMessage) {
        let deliveries = locked.stored.message.delivery_count;
        if locked.view == View::Live && deliveries >= self.options.max_delivery_count {
            debug!(
                message_id = %locked.stored.message.message_id,
                deliveries,
                "Dead-lettering message after max deliveries"
            );
            self.dead_letter(
                locked.stored,
                REASON_MAX_DELIVERY,
                format!("Message could not be consumed after {deliveries} delivery attempts."),
            );
        } else {
            self.requeue(locked.view, locked.stored);
        }
    }

    fn sweep(&mut self, now: Instant) {
        let lapsed: Vec<Uuid> = self
            .locked
            .iter()
            .filter(|(_, l)| l.locked_until <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in lapsed {
            if let Some(locked) = self.locked.remove(&token) {
                self.release(locked);
            }
        }

        let (expired, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|m| m.expires_at.is_some_and(|at| at <= now));
        self.active = kept;
        for stored in expired {
            if self.options.dead_letter_on_expiration {
                self.dead_letter(
                    stored,
                    REASON_TTL_EXPIRED,
                    "The message expired and was dead lettered.".to_string(),
                );
            }
        }
    }

    fn take_next(&mut self, view: View, now: Instant) -> Option<ReceivedMessage> {
        let mut stored = self.queue_mut(view).pop_front()?;
        stored.message.delivery_count += 1;
        stored.message.lock_token = Uuid::new_v4();
        let message = stored.message.clone();
        self.locked.insert(
            message.lock_token,
            LockedMessage {
                view,
                stored,
                locked_until: now + self.options.lock_duration,
            },
        );
        Some(message)
    }
}

#[derive(Debug, Default)]
struct TopicState {
    subscriptions: BTreeMap<String, SubscriptionState>,
}

impl TopicState {
    fn sweep(&mut self, topic: &str, now: Instant) {
        self.subscriptions.retain(|name, sub| {
            let idle = sub.is_idle(now);
            if idle {
                info!(topic = %topic, subscription = %name, "Auto-deleting idle subscription");
            }
            !idle
        });
        for sub in self.subscriptions.values_mut() {
            sub.sweep(now);
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    next_sequence: u64,
}

impl BrokerState {
    fn topic_mut(&mut self, topic: &str, now: Instant) -> Result<&mut TopicState> {
        let state = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::EntityNotFound(format!("topic {topic}")))?;
        state.sweep(topic, now);
        Ok(state)
    }

    fn subscription_mut(
        &mut self,
        topic: &str,
        name: &str,
        now: Instant,
    ) -> Result<&mut SubscriptionState> {
        self.topic_mut(topic, now)?
            .subscriptions
            .get_mut(name)
            .ok_or_else(|| BusError::EntityNotFound(format!("{topic}/Subscriptions/{name}")))
    }
}

struct BrokerInner {
    dead_letter_suffix: String,
    state: Mutex<BrokerState>,
    arrivals: Notify,
    creation_status: RwLock<Option<EntityStatus>>,
    creation_conflicts: AtomicU32,
    fail_rule_creation: RwLock<bool>,
    fail_rule_deletion: RwLock<bool>,
    failing_sends: AtomicU32,
    create_subscription_calls: AtomicUsize,
}

/// In-process broker implementing both the management and messaging APIs.
///
/// Clones share state. Failure knobs let tests drive the error paths.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_dead_letter_suffix(DEAD_LETTER_SUFFIX)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker addressing dead-letter views with a custom entity path suffix.
    pub fn with_dead_letter_suffix(suffix: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                dead_letter_suffix: suffix.into(),
                state: Mutex::default(),
                arrivals: Notify::new(),
                creation_status: RwLock::default(),
                creation_conflicts: AtomicU32::default(),
                fail_rule_creation: RwLock::default(),
                fail_rule_deletion: RwLock::default(),
                failing_sends: AtomicU32::default(),
                create_subscription_calls: AtomicUsize::default(),
            }),
        }
    }

    /// Create a topic. Creating an existing topic is a no-op.
    pub async fn create_topic(&self, topic: &str) {
        let mut state = self.inner.state.lock().await;
        state.topics.entry(topic.to_string()).or_default();
    }

    /// Remove a subscription with everything queued on it.
    pub async fn delete_subscription(&self, topic: &str, name: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let topic_state = state.topic_mut(topic, Instant::now())?;
        topic_state
            .subscriptions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BusError::EntityNotFound(format!("{topic}/Subscriptions/{name}")))
    }

    /// Force the status reported for newly created subscriptions.
    ///
    /// `None` restores the normal `Active` status.
    pub async fn set_creation_status(&self, status: Option<EntityStatus>) {
        *self.inner.creation_status.write().await = status;
    }

    /// Make the next `n` subscription creations fail as already claimed.
    pub fn set_creation_conflicts(&self, n: u32) {
        self.inner.creation_conflicts.store(n, Ordering::SeqCst);
    }

    pub async fn set_fail_rule_creation(&self, fail: bool) {
        *self.inner.fail_rule_creation.write().await = fail;
    }

    pub async fn set_fail_rule_deletion(&self, fail: bool) {
        *self.inner.fail_rule_deletion.write().await = fail;
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.inner.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Number of `create_subscription` calls seen so far.
    pub fn create_subscription_calls(&self) -> usize {
        self.inner.create_subscription_calls.load(Ordering::SeqCst)
    }

    /// Messages waiting on the live queue (excluding locked ones).
    pub async fn active_message_count(&self, topic: &str, name: &str) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        Ok(state.subscription_mut(topic, name, Instant::now())?.active.len())
    }

    /// Messages waiting on the dead-letter view (excluding locked ones).
    pub async fn dead_letter_count(&self, topic: &str, name: &str) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        Ok(state
            .subscription_mut(topic, name, Instant::now())?
            .dead_letter
            .len())
    }

    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<usize> {
        if take_one(&self.inner.failing_sends) {
            return Err(BusError::Send(format!(
                "injected failure sending {}",
                message.message_id
            )));
        }

        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        state.next_sequence += 1;
        let sequence_number = state.next_sequence;
        let topic_state = state.topic_mut(topic, now)?;

        let mut delivered = 0;
        for sub in topic_state.subscriptions.values_mut() {
            if !sub.rules.iter().any(|r| r.matches(message.subject.as_deref())) {
                continue;
            }
            let default_ttl = sub.options.default_message_ttl;
            let ttl = message
                .time_to_live
                .map_or(default_ttl, |ttl| ttl.min(default_ttl));
            sub.active.push_back(StoredMessage {
                message: ReceivedMessage {
                    message_id: message.message_id.clone(),
                    subject: message.subject.clone(),
                    body: message.body.clone(),
                    delivery_count: 0,
                    dead_letter_reason: None,
                    dead_letter_description: None,
                    enqueued_at: Utc::now(),
                    sequence_number,
                    lock_token: Uuid::nil(),
                },
                expires_at: now.checked_add(ttl),
            });
            delivered += 1;
        }
        drop(state);

        if delivered > 0 {
            self.inner.arrivals.notify_waiters();
        } else {
            debug!(topic = %topic, message_id = %message.message_id, "No subscription matched message");
        }
        Ok(delivered)
    }
}

#[async_trait]
impl ManagementClient for InMemoryBroker {
    async fn list_subscriptions(
        &self,
        topic: &str,
        page_size: usize,
        skip: usize,
    ) -> Result<Vec<SubscriptionProperties>> {
        let mut state = self.inner.state.lock().await;
        let topic_state = state.topic_mut(topic, Instant::now())?;
        Ok(topic_state
            .subscriptions
            .values()
            .skip(skip)
            .take(page_size)
            .map(SubscriptionState::properties)
            .collect())
    }

    async fn subscription_exists(&self, topic: &str, name: &str) -> Result<bool> {
        let mut state = self.inner.state.lock().await;
        let topic_state = state.topic_mut(topic, Instant::now())?;
        Ok(topic_state.subscriptions.contains_key(name))
    }

    async fn create_subscription(
        &self,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionProperties> {
        self.inner
            .create_subscription_calls
            .fetch_add(1, Ordering::SeqCst);
        if take_one(&self.inner.creation_conflicts) {
            return Err(BusError::EntityAlreadyExists(options.name));
        }
        let forced = *self.inner.creation_status.read().await;
        let status = forced.unwrap_or(EntityStatus::Active);

        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        let topic_state = state.topic_mut(&options.topic, now)?;
        if topic_state.subscriptions.contains_key(&options.name) {
            return Err(BusError::EntityAlreadyExists(options.name));
        }

        let name = options.name.clone();
        let sub = SubscriptionState::new(options, status, now);
        let properties = sub.properties();
        topic_state.subscriptions.insert(name, sub);
        Ok(properties)
    }

    async fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: RuleDescription,
    ) -> Result<()> {
        if *self.inner.fail_rule_creation.read().await {
            return Err(BusError::Management(format!(
                "injected failure creating rule {}",
                rule.name
            )));
        }
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        let sub = state.subscription_mut(topic, subscription, now)?;
        if sub.rules.iter().any(|r| r.name == rule.name) {
            return Err(BusError::EntityAlreadyExists(rule.name));
        }
        sub.rules.push(rule);
        sub.touch(now);
        Ok(())
    }

    async fn delete_rule(&self, topic: &str, subscription: &str, name: &str) -> Result<()> {
        if *self.inner.fail_rule_deletion.read().await {
            return Err(BusError::Management(format!(
                "injected failure deleting rule {name}"
            )));
        }
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        let sub = state.subscription_mut(topic, subscription, now)?;
        let before = sub.rules.len();
        sub.rules.retain(|r| r.name != name);
        if sub.rules.len() == before {
            return Err(BusError::EntityNotFound(format!(
                "{topic}/Subscriptions/{subscription}/Rules/{name}"
            )));
        }
        sub.touch(now);
        Ok(())
    }

    async fn rule_exists(&self, topic: &str, subscription: &str, name: &str) -> Result<bool> {
        let mut state = self.inner.state.lock().await;
        let sub = state.subscription_mut(topic, subscription, Instant::now())?;
        Ok(sub.rules.iter().any(|r| r.name == name))
    }

    async fn list_rules(&self, topic: &str, subscription: &str) -> Result<Vec<RuleDescription>> {
        let mut state = self.inner.state.lock().await;
        let sub = state.subscription_mut(topic, subscription, Instant::now())?;
        Ok(sub.rules.clone())
    }
}

#[async_trait]
impl MessagingClient for InMemoryBroker {
    async fn create_receiver(
        &self,
        topic: &str,
        entity_path: &str,
        options: ReceiverOptions,
    ) -> Result<Box<dyn MessageReceiver>> {
        let (subscription, view) = parse_entity_path(entity_path, &self.inner.dead_letter_suffix);
        Ok(Box::new(MemoryReceiver {
            broker: self.clone(),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            view,
            mode: options.mode,
            closed: false,
        }))
    }

    async fn create_sender(&self, topic: &str) -> Result<Box<dyn MessageSender>> {
        let state = self.inner.state.lock().await;
        if !state.topics.contains_key(topic) {
            return Err(BusError::EntityNotFound(format!("topic {topic}")));
        }
        Ok(Box::new(MemorySender {
            broker: self.clone(),
            topic: topic.to_string(),
            closed: false,
        }))
    }
}

/// Receiver bound to one subscription view of an [`InMemoryBroker`].
struct MemoryReceiver {
    broker: InMemoryBroker,
    topic: String,
    subscription: String,
    view: View,
    mode: ReceiveMode,
    closed: bool,
}

impl MemoryReceiver {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BusError::Receive(format!(
                "receiver for {} is closed",
                self.subscription
            )));
        }
        Ok(())
    }

    async fn take_available(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let mut state = self.broker.inner.state.lock().await;
        let sub = state.subscription_mut(&self.topic, &self.subscription, now)?;
        sub.touch(now);
        let mut batch = Vec::new();
        while batch.len() < max {
            match sub.take_next(self.view, now) {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        Ok(batch)
    }

    async fn wait_for(&self, max: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.broker.inner.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_available(max).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(batch);
            }
        }
    }

    async fn settle(&self, message: &ReceivedMessage, complete: bool) -> Result<()> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.broker.inner.state.lock().await;
        let sub = state.subscription_mut(&self.topic, &self.subscription, now)?;
        let locked = sub
            .locked
            .remove(&message.lock_token)
            .ok_or_else(|| BusError::LockLost(message.message_id.clone()))?;
        sub.touch(now);
        if !complete {
            sub.release(locked);
            drop(state);
            self.broker.inner.arrivals.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    fn mode(&self) -> ReceiveMode {
        self.mode
    }

    async fn receive_one(&mut self, timeout: Duration) -> Result<Option<ReceivedMessage>> {
        Ok(self.wait_for(1, timeout).await?.into_iter().next())
    }

    async fn receive_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        self.wait_for(max, timeout).await
    }

    async fn complete(&mut self, message: &ReceivedMessage) -> Result<()> {
        self.settle(message, true).await
    }

    async fn abandon(&mut self, message: &ReceivedMessage) -> Result<()> {
        self.settle(message, false).await
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Sender bound to one topic of an [`InMemoryBroker`].
struct MemorySender {
    broker: InMemoryBroker,
    topic: String,
    closed: bool,
}

#[async_trait]
impl MessageSender for MemorySender {
    async fn send(&mut self, message: OutgoingMessage) -> Result<()> {
        if self.closed {
            return Err(BusError::Send(format!("sender for {} is closed", self.topic)));
        }
        let delivered = self.broker.publish(&self.topic, message).await?;
        debug!(topic = %self.topic, delivered, "Message published");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
