//! deadlane-standalone: all three roles against an in-process topic
//!
//! ## Roles
//! ```text
//! [client]    rotate lane filter -> send N messages per iteration
//! [server]    complete a few live messages per subscription
//! [retriever] every interval: peek head subscription's dead letters -> remove
//! ```
//!
//! Unprocessed messages expire into dead-letter views, where the retriever
//! picks them up. Runs until Ctrl-C.
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - DEADLANE_CONFIG: path to a YAML config file (optional)
//! - DEADLANE__<SECTION>__<KEY>: overrides, e.g. DEADLANE__TOPIC__MESSAGE_TTL_SECS=1
//! - DEADLANE_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::info;

use deadlane::bus::InMemoryBroker;
use deadlane::config::Config;
use deadlane::dlq::{process_live_subscriptions, DeadLetterQueueProcessor, DrainEngine};
use deadlane::filter::FilterRuleManager;
use deadlane::inventory::SubscriptionInventory;
use deadlane::producer::{ClientSession, Producer};
use deadlane::scheduler::DeadLetterSweep;
use deadlane::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let mut config = Config::load(path.as_deref())?;
    info!(
        topic = %config.topic.topic,
        ttl_secs = config.topic.message_ttl_secs,
        max_delivery_count = config.topic.max_delivery_count,
        dead_letter_on_expiration = config.topic.dead_letter_on_expiration,
        "deadlane-standalone starting"
    );

    let broker = InMemoryBroker::with_dead_letter_suffix(config.topic.dead_letter_suffix.clone());
    broker.create_topic(&config.topic.topic).await;
    let shared = Arc::new(broker);
    let engine: Arc<dyn DeadLetterQueueProcessor> =
        Arc::new(DrainEngine::with_default_codec(shared.clone()));

    // Client
    let mut session = ClientSession::new(
        FilterRuleManager::new(shared.clone()),
        Producer::with_default_codec(shared.clone(), config.producer.send_delay()),
    );
    let reports = session
        .run_iterations(&mut config.topic, &config.producer)
        .await?;
    info!(iterations = reports.len(), "Client finished");

    // Server
    let mut inventory = SubscriptionInventory::new(shared.clone());
    let subscriptions = inventory.refresh(&config.topic).await?;
    let processed = process_live_subscriptions(
        engine.as_ref(),
        &config.topic,
        &subscriptions,
        config.server.messages_to_process,
    )
    .await;
    info!(processed, "Server finished");

    // Retriever
    let sweep = DeadLetterSweep::new(
        config.topic.clone(),
        inventory,
        engine,
        config.scheduler.strategy,
    );
    let handle = sweep.start(config.scheduler.interval());
    info!(interval_secs = config.scheduler.interval_secs, "Retriever started");

    shutdown_signal().await;
    let sweep = handle.shutdown().await?;
    info!(iterations = sweep.iterations(), "deadlane-standalone stopped");
    Ok(())
}
