use super::*;
use crate::config::TopicConfig;
use bytes::Bytes;

const TOPIC: &str = "lanes";

fn lane_options(name: &str) -> SubscriptionOptions {
    SubscriptionOptions::for_lane(&TopicConfig::for_topic(TOPIC), name)
}

fn message(id: &str, subject: Option<&str>) -> OutgoingMessage {
    OutgoingMessage {
        message_id: id.to_string(),
        subject: subject.map(str::to_string),
        body: Bytes::from_static(b"payload"),
        time_to_live: None,
    }
}

async fn broker_with(subscriptions: &[SubscriptionOptions]) -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.create_topic(TOPIC).await;
    for options in subscriptions {
        broker.create_subscription(options.clone()).await.unwrap();
    }
    broker
}

async fn send(broker: &InMemoryBroker, message: OutgoingMessage) {
    let mut sender = broker.create_sender(TOPIC).await.unwrap();
    sender.send(message).await.unwrap();
}

async fn receiver(broker: &InMemoryBroker, path: &str) -> Box<dyn MessageReceiver> {
    broker
        .create_receiver(TOPIC, path, ReceiverOptions::default())
        .await
        .unwrap()
}

// ============================================================================
// Entity paths
// ============================================================================

#[test]
fn test_parse_entity_path_live() {
    assert_eq!(
        parse_entity_path("a1b2c3d4", DEAD_LETTER_SUFFIX),
        ("a1b2c3d4", View::Live)
    );
}

#[test]
fn test_parse_entity_path_dead_letter_any_case() {
    assert_eq!(
        parse_entity_path("a1b2c3d4/$DeadLetterQueue", DEAD_LETTER_SUFFIX),
        ("a1b2c3d4", View::DeadLetter)
    );
    assert_eq!(
        parse_entity_path("a1b2c3d4/$deadletterqueue", DEAD_LETTER_SUFFIX),
        ("a1b2c3d4", View::DeadLetter)
    );
}

#[test]
fn test_parse_entity_path_custom_suffix() {
    assert_eq!(
        parse_entity_path("a1b2c3d4/dlq", "/dlq"),
        ("a1b2c3d4", View::DeadLetter)
    );
    assert_eq!(
        parse_entity_path("a1b2c3d4/$DeadLetterQueue", "/dlq"),
        ("a1b2c3d4/$DeadLetterQueue", View::Live)
    );
    assert_eq!(parse_entity_path("a1b2c3d4", ""), ("a1b2c3d4", View::Live));
}

// ============================================================================
// Management
// ============================================================================

#[tokio::test]
async fn test_new_subscription_carries_default_rule() {
    let broker = broker_with(&[lane_options("sub-a")]).await;

    let rules = broker.list_rules(TOPIC, "sub-a").await.unwrap();
    assert_eq!(rules, vec![RuleDescription::default_rule()]);
    assert!(broker.rule_exists(TOPIC, "sub-a", "$Default").await.unwrap());
}

#[tokio::test]
async fn test_create_existing_subscription_conflicts() {
    let broker = broker_with(&[lane_options("sub-a")]).await;

    let err = broker
        .create_subscription(lane_options("sub-a"))
        .await
        .unwrap_err();
    assert_eq!(err, BusError::EntityAlreadyExists("sub-a".into()));
    assert_eq!(broker.create_subscription_calls(), 2);
}

#[tokio::test]
async fn test_create_subscription_on_missing_topic() {
    let broker = InMemoryBroker::new();
    let err = broker
        .create_subscription(lane_options("sub-a"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_forced_creation_status_and_conflicts() {
    let broker = broker_with(&[]).await;
    broker.set_creation_status(Some(EntityStatus::Creating)).await;
    broker.set_creation_conflicts(1);

    let conflict = broker.create_subscription(lane_options("sub-a")).await;
    assert!(matches!(conflict, Err(BusError::EntityAlreadyExists(_))));

    let created = broker
        .create_subscription(lane_options("sub-a"))
        .await
        .unwrap();
    assert_eq!(created.status, EntityStatus::Creating);
    assert_eq!(broker.create_subscription_calls(), 2);
}

#[tokio::test]
async fn test_list_subscriptions_pages_by_name() {
    let options: Vec<_> = (0..5).map(|i| lane_options(&format!("sub-{i}"))).collect();
    let broker = broker_with(&options).await;

    let first = broker.list_subscriptions(TOPIC, 2, 0).await.unwrap();
    let second = broker.list_subscriptions(TOPIC, 2, 2).await.unwrap();
    let last = broker.list_subscriptions(TOPIC, 2, 4).await.unwrap();
    let past_end = broker.list_subscriptions(TOPIC, 2, 6).await.unwrap();

    let names = |page: &[SubscriptionProperties]| -> Vec<String> {
        page.iter().map(|p| p.name.clone()).collect()
    };
    assert_eq!(names(&first), vec!["sub-0", "sub-1"]);
    assert_eq!(names(&second), vec!["sub-2", "sub-3"]);
    assert_eq!(names(&last), vec!["sub-4"]);
    assert!(past_end.is_empty());
}

#[tokio::test]
async fn test_rule_create_and_delete() {
    let broker = broker_with(&[lane_options("sub-a")]).await;

    broker
        .create_rule(TOPIC, "sub-a", RuleDescription::correlation("FilterOn_x", "x"))
        .await
        .unwrap();
    let duplicate = broker
        .create_rule(TOPIC, "sub-a", RuleDescription::correlation("FilterOn_x", "x"))
        .await;
    assert!(matches!(duplicate, Err(BusError::EntityAlreadyExists(_))));

    broker.delete_rule(TOPIC, "sub-a", "$Default").await.unwrap();
    let missing = broker.delete_rule(TOPIC, "sub-a", "$Default").await;
    assert!(missing.unwrap_err().is_not_found());

    let rules = broker.list_rules(TOPIC, "sub-a").await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].name, "FilterOn_x");
}

#[tokio::test]
async fn test_rule_failure_knobs() {
    let broker = broker_with(&[lane_options("sub-a")]).await;
    broker.set_fail_rule_creation(true).await;
    broker.set_fail_rule_deletion(true).await;

    let created = broker
        .create_rule(TOPIC, "sub-a", RuleDescription::correlation("FilterOn_x", "x"))
        .await;
    assert!(matches!(created, Err(BusError::Management(_))));
    let deleted = broker.delete_rule(TOPIC, "sub-a", "$Default").await;
    assert!(matches!(deleted, Err(BusError::Management(_))));
    assert!(broker.rule_exists(TOPIC, "sub-a", "$Default").await.unwrap());
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_send_fans_out_by_rule() {
    let broker = broker_with(&[lane_options("catch-all"), lane_options("lane")]).await;
    broker
        .create_rule(TOPIC, "lane", RuleDescription::correlation("FilterOn_t1", "t1"))
        .await
        .unwrap();
    broker.delete_rule(TOPIC, "lane", "$Default").await.unwrap();

    send(&broker, message("m1", Some("t1"))).await;
    send(&broker, message("m2", Some("t2"))).await;
    send(&broker, message("m3", None)).await;

    assert_eq!(broker.active_message_count(TOPIC, "catch-all").await.unwrap(), 3);
    assert_eq!(broker.active_message_count(TOPIC, "lane").await.unwrap(), 1);
}

#[tokio::test]
async fn test_send_to_missing_topic_fails() {
    let broker = InMemoryBroker::new();
    let result = broker.create_sender("nope").await;
    assert!(result.err().is_some_and(|e| e.is_not_found()));
}

#[tokio::test]
async fn test_failing_sends_knob() {
    let broker = broker_with(&[lane_options("sub-a")]).await;
    broker.fail_next_sends(1);

    let mut sender = broker.create_sender(TOPIC).await.unwrap();
    assert!(matches!(
        sender.send(message("m1", None)).await,
        Err(BusError::Send(_))
    ));
    sender.send(message("m2", None)).await.unwrap();

    assert_eq!(broker.active_message_count(TOPIC, "sub-a").await.unwrap(), 1);
}

// ============================================================================
// Receive and settlement
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_receive_from_missing_subscription() {
    let broker = broker_with(&[]).await;
    let mut rx = receiver(&broker, "ghost/$DeadLetterQueue").await;

    let err = rx.receive_one(Duration::from_millis(100)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_receive_times_out_empty() {
    let broker = broker_with(&[lane_options("sub-a")]).await;
    let mut rx = receiver(&broker, "sub-a").await;

    let started = Instant::now();
    let received = rx.receive_one(Duration::from_millis(500)).await.unwrap();
    assert!(received.is_none());
    assert!(started.elapsed() >= Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_receive_wakes_on_arrival() {
    let broker = broker_with(&[lane_options("sub-a")]).await;
    let mut rx = receiver(&broker, "sub-a").await;

    let publisher = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        send(&publisher, message("late", None)).await;
    });

    let received = rx.receive_one(Duration::from_secs(5)).await.unwrap();
    assert_eq!(received.map(|m| m.message_id), Some("late".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_complete_removes_message() {
    let broker = broker_with(&[lane_options("sub-a")]).await;
    send(&broker, message("m1", None)).await;
    let mut rx = receiver(&broker, "sub-a").await;

    let received = rx
        .receive_one(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.delivery_count, 1);
    rx.complete(&received).await.unwrap();

    assert_eq!(broker.active_message_count(TOPIC, "sub-a").await.unwrap(), 0);
    assert!(rx
        .receive_one(Duration::from_millis(100))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn test_complete_after_lock_expiry_is_lock_lost() {
    let options = SubscriptionOptions {
        default_message_ttl: Duration::from_secs(300),
        ..lane_options("sub-a")
    };
    let broker = broker_with(&[options]).await;
    send(&broker, message("m1", None)).await;
    let mut rx = receiver(&broker, "sub-a").await;

    let received = rx
        .receive_one(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;

    let err = rx.complete(&received).await.unwrap_err();
    assert_eq!(err, BusError::LockLost("m1".into()));
    assert_eq!(broker.active_message_count(TOPIC, "sub-a").await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandon_past_max_delivery_dead_letters() {
    let options = SubscriptionOptions {
        max_delivery_count: 2,
        ..lane_options("sub-a")
    };
    let broker = broker_with(&[options]).await;
    send(&broker, message("m1", None)).await;
    let mut rx = receiver(&broker, "sub-a").await;

    for _ in 0..2 {
        let received = rx
            .receive_one(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        rx.abandon(&received).await.unwrap();
    }

    assert_eq!(broker.active_message_count(TOPIC, "sub-a").await.unwrap(), 0);
    let mut dlq = receiver(&broker, "sub-a/$DeadLetterQueue").await;
    let dead = dlq
        .receive_one(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead.dead_letter_reason.as_deref(), Some(REASON_MAX_DELIVERY));
}

#[tokio::test(start_paused = true)]
async fn test_abandon_on_dead_letter_view_keeps_message() {
    let options = SubscriptionOptions {
        max_delivery_count: 1,
        ..lane_options("sub-a")
    };
    let broker = broker_with(&[options]).await;
    send(&broker, message("m1", None)).await;

    let mut rx = receiver(&broker, "sub-a").await;
    let live = rx.receive_one(Duration::from_millis(100)).await.unwrap().unwrap();
    rx.abandon(&live).await.unwrap();

    let mut dlq = receiver(&broker, "sub-a/$DeadLetterQueue").await;
    for _ in 0..3 {
        let dead = dlq.receive_batch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(dead.len(), 1);
        dlq.abandon(&dead[0]).await.unwrap();
    }
    assert_eq!(broker.dead_letter_count(TOPIC, "sub-a").await.unwrap(), 1);
}

// ============================================================================
// Expiry and idle deletion
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_expiry_dead_letters_when_enabled() {
    let options = SubscriptionOptions {
        default_message_ttl: Duration::from_secs(1),
        dead_letter_on_expiration: true,
        ..lane_options("sub-a")
    };
    let broker = broker_with(&[options]).await;
    send(&broker, message("m1", None)).await;
    send(&broker, message("m2", None)).await;

    tokio::time::advance(Duration::from_millis(1100)).await;

    assert_eq!(broker.active_message_count(TOPIC, "sub-a").await.unwrap(), 0);
    let mut dlq = receiver(&broker, "sub-a/$DeadLetterQueue").await;
    let dead = dlq.receive_batch(10, Duration::from_millis(100)).await.unwrap();
    let ids: Vec<_> = dead.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert!(dead
        .iter()
        .all(|m| m.dead_letter_reason.as_deref() == Some(REASON_TTL_EXPIRED)));
}

#[tokio::test(start_paused = true)]
async fn test_expiry_discards_when_disabled() {
    let options = SubscriptionOptions {
        default_message_ttl: Duration::from_secs(1),
        ..lane_options("sub-a")
    };
    let broker = broker_with(&[options]).await;
    send(&broker, message("m1", None)).await;

    tokio::time::advance(Duration::from_secs(2)).await;

    assert_eq!(broker.active_message_count(TOPIC, "sub-a").await.unwrap(), 0);
    assert_eq!(broker.dead_letter_count(TOPIC, "sub-a").await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_message_ttl_capped_by_subscription_default() {
    let options = SubscriptionOptions {
        default_message_ttl: Duration::from_secs(5),
        dead_letter_on_expiration: true,
        ..lane_options("sub-a")
    };
    let broker = broker_with(&[options]).await;
    send(
        &broker,
        OutgoingMessage {
            time_to_live: Some(Duration::from_secs(60)),
            ..message("long", None)
        },
    )
    .await;
    send(
        &broker,
        OutgoingMessage {
            time_to_live: Some(Duration::from_secs(1)),
            ..message("short", None)
        },
    )
    .await;

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(broker.active_message_count(TOPIC, "sub-a").await.unwrap(), 1);

    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(broker.active_message_count(TOPIC, "sub-a").await.unwrap(), 0);
    assert_eq!(broker.dead_letter_count(TOPIC, "sub-a").await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_subscription_auto_deleted() {
    let options = SubscriptionOptions {
        auto_delete_on_idle: Duration::from_secs(60),
        ..lane_options("sub-a")
    };
    let broker = broker_with(&[options, lane_options("sub-b")]).await;

    tokio::time::advance(Duration::from_secs(61)).await;

    assert!(!broker.subscription_exists(TOPIC, "sub-a").await.unwrap());
    assert!(broker.subscription_exists(TOPIC, "sub-b").await.unwrap());
}

#[tokio::test]
async fn test_delete_subscription() {
    let broker = broker_with(&[lane_options("sub-a")]).await;

    broker.delete_subscription(TOPIC, "sub-a").await.unwrap();
    assert!(!broker.subscription_exists(TOPIC, "sub-a").await.unwrap());
    assert!(broker
        .delete_subscription(TOPIC, "sub-a")
        .await
        .unwrap_err()
        .is_not_found());
}
