//! Working list of subscriptions that may hold dead letters.
//!
//! The scheduler consumes the pending list head-first: one subscription per
//! tick, removed once drained or once the broker reports it gone. When the
//! pending list runs dry it is refilled from a fresh listing.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bus::{EntityStatus, ManagementClient, Result};
use crate::config::TopicConfig;

/// Subscriptions requested per listing page.
pub const LIST_PAGE_SIZE: usize = 100;

/// Listing stops after this many subscriptions even if pages keep coming.
pub const MAX_LISTED_SUBSCRIPTIONS: usize = 1000;

/// One listed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub name: String,
    /// Reported active at listing time.
    pub live: bool,
}

pub struct SubscriptionInventory {
    management: Arc<dyn ManagementClient>,
    entries: Vec<InventoryEntry>,
    pending: VecDeque<String>,
}

impl SubscriptionInventory {
    pub fn new(management: Arc<dyn ManagementClient>) -> Self {
        Self {
            management,
            entries: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// Re-list the topic's subscriptions and reset the pending list.
    ///
    /// Pages are requested until one comes back empty or the listing cap
    /// is reached.
    pub async fn refresh(&mut self, config: &TopicConfig) -> Result<Vec<String>> {
        let mut listed = Vec::new();
        let mut skip = 0;
        while listed.len() < MAX_LISTED_SUBSCRIPTIONS {
            let page_size = LIST_PAGE_SIZE.min(MAX_LISTED_SUBSCRIPTIONS - listed.len());
            let page = self
                .management
                .list_subscriptions(&config.topic, page_size, skip)
                .await?;
            if page.is_empty() {
                break;
            }
            skip += page.len();
            listed.extend(page.into_iter().map(|p| InventoryEntry {
                live: p.status == EntityStatus::Active,
                name: p.name,
            }));
        }
        if listed.len() >= MAX_LISTED_SUBSCRIPTIONS {
            warn!(
                topic = %config.topic,
                cap = MAX_LISTED_SUBSCRIPTIONS,
                "Subscription listing truncated"
            );
        }

        let names: Vec<String> = listed.iter().map(|e| e.name.clone()).collect();
        info!(topic = %config.topic, count = names.len(), "Subscription inventory refreshed");
        self.pending = names.iter().cloned().collect();
        self.entries = listed;
        Ok(names)
    }

    /// Refresh only if there is no pending work left.
    pub async fn ensure_pending(&mut self, config: &TopicConfig) -> Result<()> {
        if self.pending.is_empty() {
            self.refresh(config).await?;
        }
        Ok(())
    }

    /// Next subscription to work on.
    pub fn head(&self) -> Option<&str> {
        self.pending.front().map(String::as_str)
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn entries(&self) -> &[InventoryEntry] {
        &self.entries
    }

    /// Drop a subscription found empty from the pending list.
    pub fn mark_drained(&mut self, name: &str) {
        self.pending.retain(|n| n != name);
        debug!(subscription = %name, "Subscription drained");
    }

    /// Drop a subscription the broker no longer knows about.
    pub fn mark_missing(&mut self, name: &str) {
        self.pending.retain(|n| n != name);
        self.entries.retain(|e| e.name != name);
        info!(subscription = %name, "Subscription no longer exists, pruned from inventory");
    }
}
