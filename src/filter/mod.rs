//! Ephemeral lane subscriptions and their routing rules.
//!
//! A [`FilterRuleManager`] belongs to exactly one client session. It holds
//! the session's subscription key and the name of the rule currently
//! routing traffic into that subscription, and it rotates the rule when the
//! session's routing token changes.
//!
//! ## Rotation order
//!
//! The new rule is installed before the previous one is deleted. A
//! subscription may briefly carry two rules; it never carries zero.
//! Deletions that fail are remembered and retried on the next rotation.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{
    BusError, EntityStatus, ManagementClient, RuleDescription, SubscriptionOptions,
    DEFAULT_RULE_NAME,
};
use crate::config::TopicConfig;
use crate::utils::retry::{is_retryable_bus_error, subscription_creation_backoff};

/// Prefix of every lane rule name.
pub const RULE_NAME_PREFIX: &str = "FilterOn_";

/// Deterministic rule name for a routing token.
pub fn rule_name_for(token: &str) -> String {
    format!("{RULE_NAME_PREFIX}{token}")
}

/// Short token naming one ephemeral subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub const LEN: usize = 8;

    /// Fresh random key.
    pub fn generate() -> Self {
        let mut key = Uuid::new_v4().simple().to_string();
        key.truncate(Self::LEN);
        Self(key)
    }

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Subscription creation on topic {topic} failed after {attempts} attempts")]
    SubscriptionCreationFailed { topic: String, attempts: u32 },

    #[error("Routing token must not be empty")]
    InvalidRoutingToken,

    #[error("Management error: {0}")]
    Management(#[from] BusError),
}

/// Outcome of one attempt at binding a subscription.
#[derive(Debug, thiserror::Error)]
enum CreationAttemptError {
    #[error("subscription {name} was created with status {status:?}")]
    NotActive { name: String, status: EntityStatus },

    #[error("subscription name {0} is already claimed")]
    NameClaimed(String),

    #[error(transparent)]
    Transient(BusError),

    #[error(transparent)]
    Fatal(BusError),
}

impl CreationAttemptError {
    fn classify(error: BusError) -> Self {
        match error {
            BusError::EntityAlreadyExists(name) => Self::NameClaimed(name),
            e if is_retryable_bus_error(&e) => Self::Transient(e),
            e => Self::Fatal(e),
        }
    }

    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Result of a rule rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedFilter {
    /// Rule built from the routing token.
    pub rule_name: String,
    pub subscription: SubscriptionKey,
    /// False when the new rule could not be installed. The previous rule
    /// then stays current and nothing is retired.
    pub installed: bool,
    /// Rules deleted by this rotation.
    pub retired: Vec<String>,
}

/// Session-scoped owner of one lane subscription and its routing rule.
///
/// Not shareable between sessions: rotation correctness depends on a single
/// linear history of the current rule, which `&mut self` enforces.
pub struct FilterRuleManager {
    management: Arc<dyn ManagementClient>,
    subscription_key: Option<SubscriptionKey>,
    current_rule: String,
    pending_retirement: Vec<String>,
}

impl FilterRuleManager {
    pub fn new(management: Arc<dyn ManagementClient>) -> Self {
        Self {
            management,
            subscription_key: None,
            current_rule: DEFAULT_RULE_NAME.to_string(),
            pending_retirement: Vec::new(),
        }
    }

    pub fn subscription_key(&self) -> Option<&SubscriptionKey> {
        self.subscription_key.as_ref()
    }

    pub fn current_rule(&self) -> &str {
        &self.current_rule
    }

    /// Rules whose deletion failed and will be retried on the next rotation.
    pub fn pending_retirement(&self) -> &[String] {
        &self.pending_retirement
    }

    /// Forget the held subscription key; the next assignment creates a new one.
    pub fn reset_session_key(&mut self) {
        self.subscription_key = None;
        self.pending_retirement.clear();
    }

    /// Treat the default rule as current, as on a freshly created subscription.
    pub fn set_default_rule_name(&mut self) {
        self.current_rule = DEFAULT_RULE_NAME.to_string();
    }

    /// Reset both key and rule, for a new client generation.
    pub fn start_new_session(&mut self) {
        self.reset_session_key();
        self.set_default_rule_name();
    }

    /// Bind the session to an active subscription, creating it if needed.
    ///
    /// The first attempt reuses a held key, recreating its subscription if it
    /// vanished. Creation is attempted at most twice, the retry under a fresh
    /// key. Any newly created subscription starts over from `$Default`. On
    /// failure the held key is cleared so the next call starts clean.
    pub async fn assign_subscription(
        &mut self,
        config: &TopicConfig,
    ) -> Result<SubscriptionKey, FilterError> {
        let held = self.subscription_key.clone();
        let attempts = AtomicU32::new(0);

        let result = (|| {
            let management = Arc::clone(&self.management);
            let (key, reuse) = match (&held, attempts.fetch_add(1, Ordering::SeqCst)) {
                (Some(key), 0) => (key.clone(), true),
                _ => (SubscriptionKey::generate(), false),
            };
            let options = SubscriptionOptions::for_lane(config, key.as_str());
            async move { ensure_subscription(management.as_ref(), options, key, reuse).await }
        })
        .retry(subscription_creation_backoff())
        .when(CreationAttemptError::is_retryable)
        .notify(|err: &CreationAttemptError, dur: Duration| {
            warn!(
                topic = %config.topic,
                error = %err,
                retry_in_ms = dur.as_millis() as u64,
                "Subscription creation failed, retrying with a new key"
            );
        })
        .await;

        match result {
            Ok((key, created)) => {
                if created {
                    // A new subscription starts with only the default rule,
                    // even when it reuses a vanished subscription's key.
                    self.current_rule = DEFAULT_RULE_NAME.to_string();
                    self.pending_retirement.clear();
                }
                self.subscription_key = Some(key.clone());
                Ok(key)
            }
            Err(e) => {
                self.subscription_key = None;
                let attempts = attempts.load(Ordering::SeqCst);
                error!(topic = %config.topic, attempts, error = %e, "Subscription assignment failed");
                match e {
                    CreationAttemptError::Fatal(e) => Err(FilterError::Management(e)),
                    _ => Err(FilterError::SubscriptionCreationFailed {
                        topic: config.topic.clone(),
                        attempts,
                    }),
                }
            }
        }
    }

    /// Route `token` into the session's subscription.
    ///
    /// Installs `FilterOn_<token>`, then retires the previously current rule
    /// along with any rule left over from a failed deletion. Rule failures
    /// are logged and absorbed; only subscription assignment can fail.
    pub async fn rotate_filter(
        &mut self,
        config: &TopicConfig,
        token: &str,
    ) -> Result<RotatedFilter, FilterError> {
        if token.is_empty() {
            return Err(FilterError::InvalidRoutingToken);
        }
        let key = self.assign_subscription(config).await?;
        let rule_name = rule_name_for(token);

        if !self.install_rule(config, &key, &rule_name, token).await {
            return Ok(RotatedFilter {
                rule_name,
                subscription: key,
                installed: false,
                retired: Vec::new(),
            });
        }

        let previous = std::mem::replace(&mut self.current_rule, rule_name.clone());
        let mut stale = std::mem::take(&mut self.pending_retirement);
        stale.push(previous);
        stale.retain(|name| name != &rule_name);
        stale.dedup();

        let mut retired = Vec::new();
        for name in stale {
            if self.retire_rule(config, &key, &name).await {
                retired.push(name);
            } else {
                self.pending_retirement.push(name);
            }
        }

        info!(
            subscription = %key,
            rule = %rule_name,
            retired = ?retired,
            pending = self.pending_retirement.len(),
            "Filter rotated"
        );
        Ok(RotatedFilter {
            rule_name,
            subscription: key,
            installed: true,
            retired,
        })
    }

    async fn install_rule(
        &self,
        config: &TopicConfig,
        key: &SubscriptionKey,
        rule_name: &str,
        token: &str,
    ) -> bool {
        match self
            .management
            .rule_exists(&config.topic, key.as_str(), rule_name)
            .await
        {
            Ok(true) => {
                debug!(subscription = %key, rule = %rule_name, "Rule already installed");
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(subscription = %key, rule = %rule_name, error = %e, "Rule lookup failed");
            }
        }

        let rule = RuleDescription::correlation(rule_name, token);
        match self
            .management
            .create_rule(&config.topic, key.as_str(), rule)
            .await
        {
            Ok(()) => true,
            Err(BusError::EntityAlreadyExists(_)) => true,
            Err(e) => {
                warn!(
                    subscription = %key,
                    rule = %rule_name,
                    current = %self.current_rule,
                    error = %e,
                    "Rule installation failed, keeping current rule"
                );
                false
            }
        }
    }

    /// Delete a rule if it still exists. Returns false if it may remain.
    async fn retire_rule(&self, config: &TopicConfig, key: &SubscriptionKey, name: &str) -> bool {
        match self
            .management
            .rule_exists(&config.topic, key.as_str(), name)
            .await
        {
            Ok(true) => {}
            Ok(false) => return true,
            Err(e) if e.is_not_found() => return true,
            Err(e) => {
                warn!(subscription = %key, rule = %name, error = %e, "Rule lookup failed");
                return false;
            }
        }

        match self
            .management
            .delete_rule(&config.topic, key.as_str(), name)
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                warn!(subscription = %key, rule = %name, error = %e, "Rule deletion failed");
                false
            }
        }
    }
}

async fn ensure_subscription(
    management: &dyn ManagementClient,
    options: SubscriptionOptions,
    key: SubscriptionKey,
    reuse: bool,
) -> Result<(SubscriptionKey, bool), CreationAttemptError> {
    let exists = management
        .subscription_exists(&options.topic, &options.name)
        .await
        .map_err(CreationAttemptError::classify)?;
    if exists {
        return if reuse {
            Ok((key, false))
        } else {
            Err(CreationAttemptError::NameClaimed(options.name))
        };
    }

    let topic = options.topic.clone();
    let created = management
        .create_subscription(options)
        .await
        .map_err(CreationAttemptError::classify)?;
    if created.status != EntityStatus::Active {
        return Err(CreationAttemptError::NotActive {
            name: created.name,
            status: created.status,
        });
    }
    info!(topic = %topic, subscription = %key, "Lane subscription created");
    Ok((key, true))
}
