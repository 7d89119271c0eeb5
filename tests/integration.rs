use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::Instant;

use axonq::{
    Config, EnqueueRequest, Error, OrderingMode, QueueConfig, ReceiveOptions, RedrivePolicy,
    Service,
};

struct TmpService {
    svc: Service,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

async fn setup_with(adjust: impl FnOnce(&mut Config)) -> TmpService {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let path = tempfile::tempdir().unwrap();

    let mut config = Config {
        db_path: Some(path.path().join("axonq.db").to_string_lossy().to_string()),
        ..Config::default()
    };
    // Fast maintenance so retention tests finish in test time.
    config.maintenance_interval_ms = 100;
    adjust(&mut config);

    TmpService {
        svc: Service::connect_with(config).await.unwrap(),
        tmpdir: path,
    }
}

async fn setup() -> TmpService {
    setup_with(|_| {}).await
}

fn body(text: &str) -> EnqueueRequest {
    EnqueueRequest::builder().body(text.as_bytes().to_vec()).build()
}

fn fifo_body(text: &str, group: &str) -> EnqueueRequest {
    EnqueueRequest::builder()
        .body(text.as_bytes().to_vec())
        .group_key(group.to_owned())
        .build()
}

fn receive_now(visibility: Duration) -> ReceiveOptions {
    ReceiveOptions::builder()
        .max_messages(10)
        .visibility_timeout(visibility)
        .build()
}

#[tokio::test]
async fn redelivery_after_lease_expiry() {
    let service = setup().await;
    service
        .create_queue("orders", QueueConfig::default())
        .await
        .unwrap();

    let receipt = service.enqueue("orders", body("hello")).await.unwrap();

    let first = service
        .receive("orders", receive_now(Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].message_id, receipt.message_id);
    assert_eq!(first[0].receive_count, 1);
    assert_eq!(first[0].body, b"hello");

    // Leased: invisible to other consumers until the deadline passes.
    let hidden = service
        .receive("orders", receive_now(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(hidden.is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;

    let second = service
        .receive("orders", receive_now(Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message_id, receipt.message_id);
    assert_eq!(second[0].receive_count, 2);
    // A fresh lease means a fresh token; the old one is dead.
    assert_ne!(second[0].receipt_token, first[0].receipt_token);
}

#[tokio::test]
async fn concurrent_deletes_have_exactly_one_winner() {
    let service = setup().await;
    service
        .create_queue("orders", QueueConfig::default())
        .await
        .unwrap();

    service.enqueue("orders", body("once")).await.unwrap();

    let batch = service
        .receive("orders", ReceiveOptions::default())
        .await
        .unwrap();
    let message = &batch[0];

    let (left, right) = tokio::join!(
        service.delete_message("orders", message.message_id, &message.receipt_token),
        service.delete_message("orders", message.message_id, &message.receipt_token),
    );

    let wins = [&left, &right].iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);

    let loser = if left.is_err() { left } else { right };
    assert!(matches!(loser, Err(Error::InvalidReceipt)));
}

#[tokio::test]
async fn fifo_delivers_group_in_strict_order() {
    let service = setup().await;
    service
        .create_queue(
            "orders",
            QueueConfig::builder().ordering_mode(OrderingMode::Fifo).build(),
        )
        .await
        .unwrap();

    let m1 = service
        .enqueue("orders", fifo_body("m1", "customerA"))
        .await
        .unwrap();
    let m2 = service
        .enqueue("orders", fifo_body("m2", "customerA"))
        .await
        .unwrap();
    let m3 = service
        .enqueue("orders", fifo_body("m3", "customerA"))
        .await
        .unwrap();

    // Only the group head is ever offered, no matter the batch size.
    let first = service
        .receive("orders", receive_now(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].message_id, m1.message_id);

    // m2 cannot be leased while m1 is outstanding.
    assert!(service
        .receive("orders", receive_now(Duration::from_secs(30)))
        .await
        .unwrap()
        .is_empty());

    service
        .delete_message("orders", m1.message_id, &first[0].receipt_token)
        .await
        .unwrap();

    // Deleting the head frees m2, never m3.
    let second = service
        .receive("orders", receive_now(Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message_id, m2.message_id);

    // Head expiry re-opens the same message, preserving order.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let reopened = service
        .receive("orders", receive_now(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened[0].message_id, m2.message_id);
    assert_eq!(reopened[0].receive_count, 2);

    service
        .delete_message("orders", m2.message_id, &reopened[0].receipt_token)
        .await
        .unwrap();

    let third = service
        .receive("orders", receive_now(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(third[0].message_id, m3.message_id);
}

#[tokio::test]
async fn fifo_groups_proceed_in_parallel() {
    let service = setup().await;
    service
        .create_queue(
            "events",
            QueueConfig::builder().ordering_mode(OrderingMode::Fifo).build(),
        )
        .await
        .unwrap();

    service
        .enqueue("events", fifo_body("a1", "alpha"))
        .await
        .unwrap();
    service
        .enqueue("events", fifo_body("a2", "alpha"))
        .await
        .unwrap();
    service
        .enqueue("events", fifo_body("b1", "beta"))
        .await
        .unwrap();

    let batch = service
        .receive("events", receive_now(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(batch.len(), 2);
    let mut groups: Vec<_> = batch.iter().filter_map(|m| m.group_key.clone()).collect();
    groups.sort();
    assert_eq!(groups, vec!["alpha".to_owned(), "beta".to_owned()]);
}

#[tokio::test]
async fn fifo_enqueue_is_idempotent_within_dedup_window() {
    let service = setup().await;
    service
        .create_queue(
            "orders",
            QueueConfig::builder().ordering_mode(OrderingMode::Fifo).build(),
        )
        .await
        .unwrap();

    let request = EnqueueRequest::builder()
        .body(b"payload".to_vec())
        .group_key("g".to_owned())
        .dedup_key("k1".to_owned())
        .build();

    let first = service.enqueue("orders", request.clone()).await.unwrap();
    let second = service.enqueue("orders", request).await.unwrap();

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.message_id, second.message_id);

    let stats = service.queue_statistics("orders").await.unwrap();
    assert_eq!(stats.message_count, 1);
}

#[tokio::test]
async fn fifo_derives_content_dedup_key_when_absent() {
    let service = setup().await;
    service
        .create_queue(
            "orders",
            QueueConfig::builder().ordering_mode(OrderingMode::Fifo).build(),
        )
        .await
        .unwrap();

    let first = service
        .enqueue("orders", fifo_body("same-bytes", "g"))
        .await
        .unwrap();
    let dup = service
        .enqueue("orders", fifo_body("same-bytes", "g"))
        .await
        .unwrap();
    let other = service
        .enqueue("orders", fifo_body("other-bytes", "g"))
        .await
        .unwrap();

    assert!(dup.deduplicated);
    assert_eq!(first.message_id, dup.message_id);
    assert!(!other.deduplicated);
    assert_ne!(first.message_id, other.message_id);
}

#[tokio::test]
async fn standard_dedup_applies_only_to_explicit_keys() {
    let service = setup().await;
    service
        .create_queue("tasks", QueueConfig::default())
        .await
        .unwrap();

    // Same body, no key: two separate messages.
    let first = service.enqueue("tasks", body("dup")).await.unwrap();
    let second = service.enqueue("tasks", body("dup")).await.unwrap();
    assert_ne!(first.message_id, second.message_id);

    // Explicit key: best-effort suppression kicks in.
    let keyed = EnqueueRequest::builder()
        .body(b"keyed".to_vec())
        .dedup_key("job-7".to_owned())
        .build();
    let third = service.enqueue("tasks", keyed.clone()).await.unwrap();
    let fourth = service.enqueue("tasks", keyed).await.unwrap();
    assert!(fourth.deduplicated);
    assert_eq!(third.message_id, fourth.message_id);
}

#[tokio::test]
async fn exhausted_messages_move_to_dead_letter_queue() {
    let service = setup().await;
    service
        .create_queue("orders-dlq", QueueConfig::default())
        .await
        .unwrap();
    service
        .create_queue(
            "orders",
            QueueConfig::builder()
                .redrive(RedrivePolicy {
                    max_receive_count: 2,
                    dead_letter_target: "orders-dlq".to_owned(),
                })
                .build(),
        )
        .await
        .unwrap();

    let receipt = service.enqueue("orders", body("poison")).await.unwrap();

    // Two lease grants, neither deleted.
    for expected in 1..=2u32 {
        let batch = service
            .receive("orders", receive_now(Duration::from_millis(150)))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1, "grant {expected} should deliver");
        assert_eq!(batch[0].receive_count, expected);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    // Gone from the source queue for good.
    assert!(service
        .receive("orders", receive_now(Duration::from_secs(30)))
        .await
        .unwrap()
        .is_empty());

    let dead = service
        .receive("orders-dlq", receive_now(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, b"poison");
    // The copy starts over, with provenance recorded in attributes.
    assert_eq!(dead[0].receive_count, 1);
    assert_eq!(
        dead[0].attributes.get(axonq::redrive::SOURCE_QUEUE_ATTRIBUTE),
        Some(&"orders".to_owned())
    );
    assert_eq!(
        dead[0]
            .attributes
            .get(axonq::redrive::SOURCE_MESSAGE_ATTRIBUTE),
        Some(&receipt.message_id.to_string())
    );
    assert_eq!(
        dead[0]
            .attributes
            .get(axonq::redrive::SOURCE_RECEIVES_ATTRIBUTE),
        Some(&"2".to_owned())
    );
}

#[tokio::test]
async fn long_poll_returns_empty_at_the_bound() {
    let service = setup().await;
    service
        .create_queue("idle", QueueConfig::default())
        .await
        .unwrap();

    let started = Instant::now();
    let batch = service
        .receive(
            "idle",
            ReceiveOptions::builder()
                .wait_time(Duration::from_millis(300))
                .build(),
        )
        .await
        .unwrap();

    assert!(batch.is_empty());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(290), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "overslept: {elapsed:?}");
}

#[tokio::test]
async fn long_poll_wakes_on_mid_wait_enqueue() {
    let service = Arc::new(setup().await);
    service
        .create_queue("busy", QueueConfig::default())
        .await
        .unwrap();

    let producer = Arc::clone(&service);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        producer.enqueue("busy", body("late")).await.unwrap();
    });

    let started = Instant::now();
    let batch = service
        .receive(
            "busy",
            ReceiveOptions::builder()
                .wait_time(Duration::from_secs(5))
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].body, b"late");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "should return on enqueue, not at the bound"
    );
}

#[tokio::test]
async fn change_visibility_extends_and_zero_releases() {
    let service = setup().await;
    service
        .create_queue("work", QueueConfig::default())
        .await
        .unwrap();

    // Extension outlives the original deadline.
    service.enqueue("work", body("extend-me")).await.unwrap();
    let batch = service
        .receive("work", receive_now(Duration::from_millis(200)))
        .await
        .unwrap();
    service
        .change_visibility(
            "work",
            batch[0].message_id,
            &batch[0].receipt_token,
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(service
        .receive("work", receive_now(Duration::from_secs(30)))
        .await
        .unwrap()
        .is_empty());

    // Zero is an explicit early release: immediately receivable again and
    // the old token is invalidated.
    service
        .change_visibility(
            "work",
            batch[0].message_id,
            &batch[0].receipt_token,
            Duration::ZERO,
        )
        .await
        .unwrap();

    let again = service
        .receive("work", receive_now(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].receive_count, 2);

    assert!(matches!(
        service
            .delete_message("work", batch[0].message_id, &batch[0].receipt_token)
            .await,
        Err(Error::InvalidReceipt)
    ));

    service
        .delete_message("work", again[0].message_id, &again[0].receipt_token)
        .await
        .unwrap();
}

#[tokio::test]
async fn delayed_messages_stay_hidden_until_due() {
    let service = setup().await;
    service
        .create_queue("slow", QueueConfig::default())
        .await
        .unwrap();

    service
        .enqueue(
            "slow",
            EnqueueRequest::builder()
                .body(b"later".to_vec())
                .delay(Duration::from_millis(250))
                .build(),
        )
        .await
        .unwrap();

    assert!(service
        .receive("slow", receive_now(Duration::from_secs(30)))
        .await
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(700)).await;

    let batch = service
        .receive("slow", receive_now(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].receive_count, 1);
}

#[tokio::test]
async fn retention_expiry_purges_messages() {
    let service = setup().await;
    service
        .create_queue(
            "ephemeral",
            QueueConfig::builder()
                .retention_period(Duration::from_millis(150))
                .build(),
        )
        .await
        .unwrap();

    service.enqueue("ephemeral", body("fleeting")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(service
        .receive("ephemeral", receive_now(Duration::from_secs(30)))
        .await
        .unwrap()
        .is_empty());

    let stats = service.queue_statistics("ephemeral").await.unwrap();
    assert_eq!(stats.message_count, 0);
}

#[tokio::test]
async fn waiters_beyond_the_cap_are_shed() {
    let service = Arc::new(
        setup_with(|config| {
            config.max_waiters_per_queue = 1;
        })
        .await,
    );
    service
        .create_queue("crowded", QueueConfig::default())
        .await
        .unwrap();

    let occupant = Arc::clone(&service);
    let waiter = tokio::spawn(async move {
        occupant
            .receive(
                "crowded",
                ReceiveOptions::builder()
                    .wait_time(Duration::from_millis(800))
                    .build(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let shed = service
        .receive(
            "crowded",
            ReceiveOptions::builder()
                .wait_time(Duration::from_millis(800))
                .build(),
        )
        .await;
    assert!(matches!(shed, Err(Error::Throttled)));

    let first = waiter.await.unwrap().unwrap();
    assert!(first.is_empty());
}

#[tokio::test]
async fn the_order_42_scenario() {
    let service = setup().await;
    service
        .create_queue(
            "orders",
            QueueConfig::builder()
                .ordering_mode(OrderingMode::Fifo)
                .dedup_window(Duration::from_secs(60))
                .default_visibility_timeout(Duration::from_millis(300))
                .build(),
        )
        .await
        .unwrap();

    let receipt = service
        .enqueue("orders", fifo_body("order-42", "customerA"))
        .await
        .unwrap();

    let first = service
        .receive("orders", ReceiveOptions::default())
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].message_id, receipt.message_id);
    assert_eq!(first[0].receive_count, 1);

    // No delete; wait out the visibility timeout.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let second = service
        .receive("orders", ReceiveOptions::default())
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message_id, receipt.message_id);
    assert_eq!(second[0].receive_count, 2);
}

#[tokio::test]
async fn enqueue_validations() {
    let service = setup().await;
    service
        .create_queue("std", QueueConfig::default())
        .await
        .unwrap();
    service
        .create_queue(
            "fifo",
            QueueConfig::builder().ordering_mode(OrderingMode::Fifo).build(),
        )
        .await
        .unwrap();

    assert!(matches!(
        service.enqueue("missing", body("x")).await,
        Err(Error::QueueNotFound { .. })
    ));

    assert!(matches!(
        service.enqueue("fifo", body("no-group")).await,
        Err(Error::MissingParameter { .. })
    ));

    assert!(matches!(
        service
            .enqueue(
                "fifo",
                EnqueueRequest::builder()
                    .body(b"x".to_vec())
                    .group_key("g".to_owned())
                    .delay(Duration::from_secs(1))
                    .build(),
            )
            .await,
        Err(Error::InvalidParameter { .. })
    ));

    let oversized = vec![0u8; service.config().max_message_size + 1];
    assert!(matches!(
        service
            .enqueue("std", EnqueueRequest::builder().body(oversized).build())
            .await,
        Err(Error::MessageTooLarge { .. })
    ));

    let attributes = (0..service.config().max_attributes + 1)
        .map(|i| (format!("k{i}"), "v".to_owned()))
        .collect();
    assert!(matches!(
        service
            .enqueue(
                "std",
                EnqueueRequest::builder()
                    .body(b"x".to_vec())
                    .attributes(attributes)
                    .build(),
            )
            .await,
        Err(Error::AttributeLimitExceeded { .. })
    ));
}

#[tokio::test]
async fn queue_administration_rules() {
    let service = setup().await;
    service
        .create_queue("alpha", QueueConfig::default())
        .await
        .unwrap();

    assert!(matches!(
        service.create_queue("alpha", QueueConfig::default()).await,
        Err(Error::QueueExists { .. })
    ));

    // No self-loop dead-letter targets.
    assert!(matches!(
        service
            .create_queue(
                "beta",
                QueueConfig::builder()
                    .redrive(RedrivePolicy {
                        max_receive_count: 3,
                        dead_letter_target: "beta".to_owned(),
                    })
                    .build(),
            )
            .await,
        Err(Error::InvalidParameter { .. })
    ));

    // A dead-letter target must share the ordering mode.
    assert!(matches!(
        service
            .create_queue(
                "gamma",
                QueueConfig::builder()
                    .ordering_mode(OrderingMode::Fifo)
                    .redrive(RedrivePolicy {
                        max_receive_count: 3,
                        dead_letter_target: "alpha".to_owned(),
                    })
                    .build(),
            )
            .await,
        Err(Error::InvalidParameter { .. })
    ));

    // A queue in use as a dead-letter target cannot be deleted.
    service
        .create_queue(
            "delta",
            QueueConfig::builder()
                .redrive(RedrivePolicy {
                    max_receive_count: 3,
                    dead_letter_target: "alpha".to_owned(),
                })
                .build(),
        )
        .await
        .unwrap();
    assert!(matches!(
        service.delete_queue("alpha").await,
        Err(Error::InvalidParameter { .. })
    ));

    service.delete_queue("delta").await.unwrap();
    service.delete_queue("alpha").await.unwrap();
    assert!(matches!(
        service.queue_attributes("alpha").await,
        Err(Error::QueueNotFound { .. })
    ));
}

#[tokio::test]
async fn purge_empties_the_queue() {
    let service = setup().await;
    service
        .create_queue("bulk", QueueConfig::default())
        .await
        .unwrap();

    for i in 0..3 {
        service
            .enqueue("bulk", body(&format!("m{i}")))
            .await
            .unwrap();
    }

    assert_eq!(service.purge_queue("bulk").await.unwrap(), 3);
    assert_eq!(
        service.queue_statistics("bulk").await.unwrap().message_count,
        0
    );
}

#[tokio::test]
async fn fifo_state_survives_restart() {
    let tmpdir = tempfile::tempdir().unwrap();
    let config = Config {
        db_path: Some(tmpdir.path().join("axonq.db").to_string_lossy().to_string()),
        ..Config::default()
    };

    let service = Service::connect_with(config.clone()).await.unwrap();
    service
        .create_queue(
            "orders",
            QueueConfig::builder().ordering_mode(OrderingMode::Fifo).build(),
        )
        .await
        .unwrap();
    let m1 = service
        .enqueue("orders", fifo_body("m1", "g"))
        .await
        .unwrap();
    service
        .enqueue("orders", fifo_body("m2", "g"))
        .await
        .unwrap();
    service.close().await;

    let service = Service::connect_with(config).await.unwrap();
    let batch = service
        .receive("orders", ReceiveOptions::default())
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message_id, m1.message_id);
}
