//! Self-rearming, non-reentrant sweep scheduler.
//!
//! A single spawned loop waits one interval, runs one tick to completion,
//! then waits again. Ticks therefore never overlap, and the first tick
//! fires one interval after start. Failures and panics inside a tick are
//! logged and recorded; the loop always rearms.
//!
//! Stopping is cooperative: a tick in flight finishes, and no further tick
//! starts.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::bus::BusError;
use crate::config::{SweepStrategy, TopicConfig};
use crate::dlq::{DeadLetterQueueProcessor, DlqError, QueueView};
use crate::inventory::SubscriptionInventory;

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Inventory refresh failed: {0}")]
    Inventory(#[source] BusError),

    #[error("Processing subscription {subscription} failed: {source}")]
    Drain {
        subscription: String,
        #[source]
        source: DlqError,
    },
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The topic has no subscriptions.
    NoSubscriptions,
    /// The head subscription vanished and was pruned.
    Missing { subscription: String },
    /// The head subscription had no dead letters and was marked drained.
    Empty { subscription: String },
    /// Dead letters were removed from the head subscription.
    Drained { subscription: String, count: usize },
    /// The tick failed or panicked.
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed,
    Ticking,
    Stopped,
}

/// Observable scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// Ticks completed, including failed ones.
    pub ticks: u64,
    pub last_outcome: Option<TickOutcome>,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            ticks: 0,
            last_outcome: None,
        }
    }
}

/// Unit of work run once per interval.
#[async_trait]
pub trait TickTask: Send + 'static {
    async fn tick(&mut self) -> Result<TickOutcome, SweepError>;
}

/// Fixed-interval scheduler.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    interval: Duration,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the loop. The first tick fires after one interval.
    pub fn start<T: TickTask>(&self, task: T) -> SchedulerHandle<T> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(SchedulerStatus::default());
        let join = tokio::spawn(run_loop(self.interval, task, cancel_rx, status_tx));
        SchedulerHandle {
            cancel: cancel_tx,
            status: status_rx,
            join,
        }
    }
}

/// Handle to a running scheduler.
///
/// Dropping the handle stops the scheduler after any tick in flight.
pub struct SchedulerHandle<T> {
    cancel: watch::Sender<bool>,
    status: watch::Receiver<SchedulerStatus>,
    join: JoinHandle<T>,
}

impl<T> SchedulerHandle<T> {
    /// Signal the scheduler to stop. Idempotent.
    pub fn stop(&self) {
        self.cancel.send_replace(true);
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop, wait for the loop to exit, and hand back the task.
    pub async fn shutdown(self) -> Result<T, JoinError> {
        self.stop();
        self.join.await
    }
}

async fn run_loop<T: TickTask>(
    interval: Duration,
    mut task: T,
    mut cancel: watch::Receiver<bool>,
    status: watch::Sender<SchedulerStatus>,
) -> T {
    info!(interval_ms = interval.as_millis() as u64, "Scheduler started");

    loop {
        status.send_modify(|s| s.state = SchedulerState::Armed);
        tokio::select! {
            biased;
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow_and_update() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        status.send_modify(|s| s.state = SchedulerState::Ticking);
        let outcome = match AssertUnwindSafe(task.tick()).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(error = %e, "Sweep tick failed");
                TickOutcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Sweep tick panicked");
                TickOutcome::Failed {
                    error: format!("panic: {message}"),
                }
            }
        };
        status.send_modify(|s| {
            s.ticks += 1;
            s.last_outcome = Some(outcome);
        });
    }

    status.send_modify(|s| s.state = SchedulerState::Stopped);
    info!("Scheduler stopped");
    task
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Dead-letter reclamation for one topic, one subscription per tick.
pub struct DeadLetterSweep {
    config: TopicConfig,
    inventory: SubscriptionInventory,
    processor: Arc<dyn DeadLetterQueueProcessor>,
    strategy: SweepStrategy,
    iteration: u64,
}

impl DeadLetterSweep {
    pub fn new(
        config: TopicConfig,
        inventory: SubscriptionInventory,
        processor: Arc<dyn DeadLetterQueueProcessor>,
        strategy: SweepStrategy,
    ) -> Self {
        Self {
            config,
            inventory,
            processor,
            strategy,
            iteration: 0,
        }
    }

    pub fn inventory(&self) -> &SubscriptionInventory {
        &self.inventory
    }

    /// Ticks run so far.
    pub fn iterations(&self) -> u64 {
        self.iteration
    }

    /// Run this sweep on a [`Scheduler`] with the given interval.
    pub fn start(self, interval: Duration) -> SchedulerHandle<Self> {
        Scheduler::new(interval).start(self)
    }

    /// One pass over the head of the pending list.
    pub async fn run_once(&mut self) -> Result<TickOutcome, SweepError> {
        self.iteration += 1;
        info!(iteration = self.iteration, topic = %self.config.topic, "Dead-letter lookup");

        self.inventory
            .ensure_pending(&self.config)
            .await
            .map_err(SweepError::Inventory)?;
        let Some(head) = self.inventory.head().map(str::to_string) else {
            return Ok(TickOutcome::NoSubscriptions);
        };

        let result = match self.strategy {
            SweepStrategy::PeekThenBatch => self.peek_then_batch(&head).await,
            SweepStrategy::Drain => self.drain(&head).await,
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_not_found() => {
                self.inventory.mark_missing(&head);
                Ok(TickOutcome::Missing { subscription: head })
            }
            Err(source) => Err(SweepError::Drain {
                subscription: head,
                source,
            }),
        }
    }

    async fn peek_then_batch(&mut self, head: &str) -> Result<TickOutcome, DlqError> {
        let max = self.config.max_messages_per_iteration.max(1);
        let peeked = self
            .processor
            .process_batch(&self.config, head, QueueView::DeadLetter, max, false)
            .await?;
        if peeked.is_empty() {
            self.inventory.mark_drained(head);
            return Ok(TickOutcome::Empty {
                subscription: head.to_string(),
            });
        }

        warn!(subscription = %head, depth = peeked.len(), "Dead letters found");
        let removed = self
            .processor
            .process_batch(&self.config, head, QueueView::DeadLetter, max, true)
            .await?;
        for (i, entry) in removed.iter().enumerate() {
            info!(
                subscription = %head,
                message_id = %entry.message_id,
                token = %entry.session_token,
                delivery_count = entry.delivery_count,
                "{}",
                entry.log_line(i + 1)
            );
        }
        Ok(TickOutcome::Drained {
            subscription: head.to_string(),
            count: removed.len(),
        })
    }

    async fn drain(&mut self, head: &str) -> Result<TickOutcome, DlqError> {
        let result = self.processor.drain(&self.config, head).await?;
        self.inventory.mark_drained(head);
        if result.count == 0 {
            Ok(TickOutcome::Empty {
                subscription: head.to_string(),
            })
        } else {
            Ok(TickOutcome::Drained {
                subscription: head.to_string(),
                count: result.count,
            })
        }
    }
}

#[async_trait]
impl TickTask for DeadLetterSweep {
    #[tracing::instrument(name = "scheduler.tick", skip_all)]
    async fn tick(&mut self) -> Result<TickOutcome, SweepError> {
        self.run_once().await
    }
}
