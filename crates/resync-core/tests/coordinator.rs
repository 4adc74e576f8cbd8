use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;

use resync_core::config::{RateLimitConfig, SyncConfig};
use resync_core::domain::{
    ActionId, Category, ConnectionState, DeliveryError, DropReason, EntryStatus, Submission,
    SyncError, SyncEvent, TaskKey, TaskState,
};
use resync_core::impls::{InMemoryDocumentStore, InMemoryStorage};
use resync_core::ports::{ConnectivitySignal, TokioClock};
use resync_core::tasks::ScheduledTask;
use resync_core::{CoordinatorBuilder, InboundOutcome, ListenerHandle, SyncCoordinator};

struct Harness {
    store: InMemoryDocumentStore,
    storage: InMemoryStorage,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: InMemoryDocumentStore::new(),
            storage: InMemoryStorage::new(),
        }
    }

    async fn start(&self, config: SyncConfig, state: ConnectionState) -> SyncCoordinator {
        CoordinatorBuilder::new()
            .config(config)
            .document_store(self.store.clone())
            .storage(self.storage.clone())
            .clock(TokioClock::new())
            .connectivity(ConnectivitySignal::new(state))
            .build()
            .await
            .unwrap()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn next_event(
    rx: &mut broadcast::Receiver<SyncEvent>,
    mut wanted: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    let found = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = rx.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await;
    found.unwrap()
}

fn record_drops(
    coordinator: &SyncCoordinator,
) -> (Arc<Mutex<Vec<(ActionId, String)>>>, ListenerHandle) {
    let drops = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&drops);
    let handle = coordinator.on_dropped(move |id, reason| {
        sink.lock().push((id, reason.as_str().to_string()));
    });
    (drops, handle)
}

// ========================================
// Outbound
// ========================================

#[tokio::test(start_paused = true)]
async fn online_submit_writes_directly() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Online).await;

    coordinator.submit("chat", json!({ "text": "hi" })).await.unwrap();

    assert_eq!(h.store.write_count(), 1);
    assert_eq!(coordinator.queue_depth(), 0);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn offline_submissions_drain_in_order_on_reconnect() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Offline).await;
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    let _handle = coordinator.on_delivered(move |id, _| sink.lock().push(id));

    let mut ids = Vec::new();
    for n in 1..=3 {
        ids.push(
            coordinator
                .submit("chat", json!({ "n": n }))
                .await
                .unwrap(),
        );
    }
    assert_eq!(coordinator.queue_depth(), 3);
    assert_eq!(h.store.attempt_count(), 0);
    assert_eq!(coordinator.timeline().pending_count(), 3);

    coordinator.connectivity().set_online();
    eventually("queue drained", || coordinator.queue_depth() == 0).await;

    let written: Vec<_> = h
        .store
        .writes("chat")
        .into_iter()
        .map(|w| w.request.payload["n"].clone())
        .collect();
    assert_eq!(written, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(*delivered.lock(), ids);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn queued_actions_survive_a_restart() {
    let h = Harness::new();
    let first = h.start(SyncConfig::default(), ConnectionState::Offline).await;
    let id = first.submit("chat", json!({ "text": "later" })).await.unwrap();
    first.shutdown().await;
    drop(first);

    let second = h.start(SyncConfig::default(), ConnectionState::Offline).await;
    assert_eq!(second.queue_depth(), 1);
    assert_eq!(second.queued().await[0].id, id);
    // restored ids count as sent
    let again = second
        .submit_action(Submission::new("chat", json!({})).with_id(id))
        .await;
    assert!(matches!(again, Err(SyncError::Duplicate(d)) if d == id));

    second.connectivity().set_online();
    eventually("restored queue drained", || second.queue_depth() == 0).await;
    assert_eq!(h.store.write_count(), 1);
    second.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_direct_failure_falls_back_to_the_queue() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Online).await;
    h.store
        .fail_next(DeliveryError::Transient("socket reset".into()));

    coordinator.submit("chat", json!({ "text": "retry me" })).await.unwrap();

    eventually("retried delivery", || h.store.write_count() == 1).await;
    eventually("queue drained", || coordinator.queue_depth() == 0).await;
    assert_eq!(h.store.attempt_count(), 2);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn direct_attempt_counts_toward_max_retries() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Online).await;
    let mut events = coordinator.events();
    h.store
        .set_failing(Some(DeliveryError::Transient("backend down".into())));

    let started = tokio::time::Instant::now();
    let id = coordinator.submit("chat", json!({ "text": "doomed" })).await.unwrap();

    let queued = coordinator.queued().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 1);
    assert!(queued[0].next_attempt_at.is_some());

    let dropped = next_event(&mut events, |e| matches!(e, SyncEvent::Dropped { .. })).await;
    assert_eq!(
        dropped,
        SyncEvent::Dropped {
            action_id: id,
            reason: DropReason::MaxRetriesExceeded
        }
    );
    assert_eq!(h.store.attempt_count(), 3);
    // direct, then 1s and 2s of backoff
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(coordinator.queue_depth(), 0);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn single_attempt_budget_drops_on_direct_failure() {
    let h = Harness::new();
    let mut config = SyncConfig::default();
    config.offline.max_retries = 1;
    let coordinator = h.start(config, ConnectionState::Online).await;
    let (drops, _guard) = record_drops(&coordinator);
    h.store
        .fail_next(DeliveryError::Transient("socket reset".into()));

    let id = coordinator.submit("chat", json!({ "text": "once" })).await.unwrap();

    assert_eq!(*drops.lock(), vec![(id, "max-retries-exceeded".to_string())]);
    assert_eq!(coordinator.queue_depth(), 0);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.store.attempt_count(), 1);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_reported_not_retried() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Online).await;
    let (drops, _guard) = record_drops(&coordinator);
    h.store
        .fail_next(DeliveryError::Permanent("forbidden".into()));

    let id = coordinator.submit("chat", json!({ "text": "no" })).await.unwrap();

    assert_eq!(*drops.lock(), vec![(id, "rejected".to_string())]);
    assert_eq!(coordinator.queue_depth(), 0);
    let timeline = coordinator.timeline();
    let entry = timeline.find(id).unwrap();
    assert!(matches!(entry.status, EntryStatus::Failed { .. }));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.store.attempt_count(), 1);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn always_failing_backend_drops_after_max_retries() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Offline).await;
    let (drops, _guard) = record_drops(&coordinator);
    let mut events = coordinator.events();
    h.store
        .set_failing(Some(DeliveryError::Transient("offline backend".into())));

    let id = coordinator.submit("chat", json!({ "text": "doomed" })).await.unwrap();
    let started = tokio::time::Instant::now();
    coordinator.connectivity().set_online();

    let dropped = next_event(&mut events, |e| matches!(e, SyncEvent::Dropped { .. })).await;
    assert_eq!(
        dropped,
        SyncEvent::Dropped {
            action_id: id,
            reason: DropReason::MaxRetriesExceeded
        }
    );
    assert_eq!(h.store.attempt_count(), 3);
    // backoff 1s then 2s
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(*drops.lock(), vec![(id, "max-retries-exceeded".to_string())]);
    assert_eq!(coordinator.queue_depth(), 0);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limited_submission_is_refused_and_leaves_no_trace() {
    let h = Harness::new();
    let config = SyncConfig::default()
        .with_rate_limit("chat", RateLimitConfig::new(3, 1000).with_block(2000));
    let coordinator = h.start(config, ConnectionState::Online).await;

    for n in 0..3 {
        coordinator.submit("chat", json!({ "n": n })).await.unwrap();
    }
    let denied = coordinator.submit("chat", json!({ "n": 3 })).await;
    match denied {
        Err(SyncError::RateLimited { retry_after_ms, .. }) => assert!(retry_after_ms > 0),
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(h.store.write_count(), 3);
    assert_eq!(coordinator.timeline().len(), 3);
    assert!(
        coordinator
            .rate_limit_status(&Category::new("chat"))
            .blocked_for_ms
            > 0
    );

    tokio::time::advance(Duration::from_millis(2000)).await;
    coordinator.submit("chat", json!({ "n": 4 })).await.unwrap();
    assert_eq!(h.store.write_count(), 4);

    // other categories are not limited
    coordinator.submit("presence", json!({})).await.unwrap();
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn actors_are_limited_independently() {
    let h = Harness::new();
    let config = SyncConfig::default().with_rate_limit("chat", RateLimitConfig::new(1, 10_000));
    let coordinator = h.start(config, ConnectionState::Online).await;

    let alice = || Submission::new("chat", json!({ "text": "hi" })).by_actor("alice");
    coordinator.submit_action(alice()).await.unwrap();
    assert!(matches!(
        coordinator.submit_action(alice()).await,
        Err(SyncError::RateLimited { .. })
    ));
    coordinator
        .submit_action(Submission::new("chat", json!({ "text": "hey" })).by_actor("bob"))
        .await
        .unwrap();

    assert_eq!(h.store.write_count(), 2);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn queued_actions_drain_under_their_own_actor() {
    let h = Harness::new();
    let config = SyncConfig::default().with_rate_limit("chat", RateLimitConfig::new(1, 1000));
    let coordinator = h.start(config, ConnectionState::Offline).await;

    for actor in ["alice", "bob"] {
        coordinator
            .submit_action(Submission::new("chat", json!({ "from": actor })).by_actor(actor))
            .await
            .unwrap();
    }
    let queued = coordinator.queued().await;
    assert_eq!(queued[0].actor.as_deref(), Some("alice"));
    assert_eq!(queued[1].actor.as_deref(), Some("bob"));

    // both submit-time windows have expired
    tokio::time::advance(Duration::from_millis(1000)).await;
    let started = tokio::time::Instant::now();
    coordinator.connectivity().set_online();

    eventually("queue drained", || coordinator.queue_depth() == 0).await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(h.store.write_count(), 2);
    // the category-wide window was never charged
    assert_eq!(coordinator.rate_limit_status(&Category::new("chat")).remaining, 1);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn draining_a_full_window_does_not_start_a_block() {
    let h = Harness::new();
    let config = SyncConfig::default()
        .with_rate_limit("chat", RateLimitConfig::new(3, 1000).with_block(2000));
    let coordinator = h.start(config, ConnectionState::Offline).await;

    for n in 0..3 {
        coordinator.submit("chat", json!({ "n": n })).await.unwrap();
    }
    let started = tokio::time::Instant::now();
    coordinator.connectivity().set_online();

    eventually("queue drained", || coordinator.queue_depth() == 0).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1000));
    assert!(elapsed < Duration::from_millis(2000));
    assert_eq!(h.store.write_count(), 3);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn overflowing_queue_refuses_synchronously() {
    let h = Harness::new();
    let mut config = SyncConfig::default();
    config.offline.max_queue_size = 2;
    let coordinator = h.start(config, ConnectionState::Offline).await;

    coordinator.submit("chat", json!({ "n": 1 })).await.unwrap();
    coordinator.submit("chat", json!({ "n": 2 })).await.unwrap();
    let third = coordinator.submit("chat", json!({ "n": 3 })).await;

    assert!(matches!(third, Err(SyncError::Overflow { capacity: 2 })));
    assert_eq!(coordinator.queue_depth(), 2);
    assert_eq!(coordinator.timeline().pending_count(), 2);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn double_fired_submission_is_a_duplicate() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Online).await;
    let id = coordinator.next_action_id();

    let submission = Submission::new("chat", json!({ "text": "once" })).with_id(id);
    coordinator.submit_action(submission.clone()).await.unwrap();
    let again = coordinator.submit_action(submission).await;

    assert!(matches!(again, Err(SyncError::Duplicate(d)) if d == id));
    assert_eq!(h.store.write_count(), 1);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_submission_is_never_queued() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Offline).await;

    let result = coordinator.submit("  ", json!({})).await;

    assert!(matches!(result, Err(SyncError::Validation(_))));
    assert_eq!(coordinator.queue_depth(), 0);
    assert!(coordinator.timeline().is_empty());
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn clearing_the_queue_reports_each_action() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Offline).await;
    let (drops, _guard) = record_drops(&coordinator);

    let a = coordinator.submit("chat", json!({ "n": 1 })).await.unwrap();
    let b = coordinator.submit("chat", json!({ "n": 2 })).await.unwrap();
    let cleared = coordinator.clear_queue().await.unwrap();

    assert_eq!(cleared.len(), 2);
    assert_eq!(coordinator.queue_depth(), 0);
    assert_eq!(
        *drops.lock(),
        vec![(a, "cleared".to_string()), (b, "cleared".to_string())]
    );
    coordinator.shutdown().await;
}

// ========================================
// Inbound
// ========================================

#[tokio::test(start_paused = true)]
async fn echo_of_own_write_confirms_instead_of_applying() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Online).await;
    let applied = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&applied);
    let _handle = coordinator.on_applied(move |_| *counter.lock() += 1);
    let mut events = coordinator.events();

    coordinator.open_view("chat").unwrap();
    let id = coordinator.submit("chat", json!({ "text": "mine" })).await.unwrap();

    let confirmed = next_event(&mut events, |e| matches!(e, SyncEvent::Confirmed { .. })).await;
    assert!(matches!(confirmed, SyncEvent::Confirmed { action_id, .. } if action_id == id));
    assert_eq!(*applied.lock(), 0);
    assert_eq!(coordinator.timeline().len(), 1);
    assert_eq!(coordinator.timeline().pending_count(), 0);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn redelivered_remote_event_is_applied_once() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Online).await;
    let applied = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&applied);
    let _handle = coordinator.on_applied(move |e| sink.lock().push(e.event_id));

    coordinator.open_view("chat").unwrap();
    let event = h
        .store
        .publish_remote("chat", Category::new("chat"), json!({ "text": "hello" }));
    eventually("remote event applied", || applied.lock().len() == 1).await;

    h.store.redeliver(&event);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*applied.lock(), vec![event.event_id]);
    assert_eq!(coordinator.timeline().len(), 1);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn events_from_a_superseded_view_are_discarded() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Online).await;

    let first = coordinator.open_view("rooms/a").unwrap();
    let second = coordinator.open_view("rooms/b").unwrap();
    assert!(second > first);
    assert_eq!(h.store.subscriber_count("rooms/a"), 0);
    assert_eq!(h.store.subscriber_count("rooms/b"), 1);

    let late = h
        .store
        .publish_remote("rooms/a", Category::new("chat"), json!({ "text": "late" }));
    assert_eq!(
        coordinator.apply_inbound(first, late.clone()),
        InboundOutcome::Stale
    );
    assert!(coordinator.timeline().is_empty());

    // a stale event is not remembered as received
    assert_eq!(
        coordinator.apply_inbound(second, late.clone()),
        InboundOutcome::Applied
    );
    assert_eq!(
        coordinator.apply_inbound(second, late),
        InboundOutcome::Duplicate
    );
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn applied_event_schedules_a_settle_task() {
    let h = Harness::new();
    let config = SyncConfig {
        settle_ms: Some(300),
        ..SyncConfig::default()
    };
    let coordinator = h.start(config, ConnectionState::Online).await;
    let mut events = coordinator.events();

    coordinator.open_view("chat").unwrap();
    let event = h
        .store
        .publish_remote("chat", Category::new("chat"), json!({ "text": "wave" }));

    let settled = next_event(&mut events, |e| matches!(e, SyncEvent::Settled { .. })).await;
    match settled {
        SyncEvent::Settled { key, timed_out } => {
            assert_eq!(key.as_str(), format!("settle:{}", event.event_id));
            assert!(!timed_out);
        }
        other => panic!("unexpected {other:?}"),
    }
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reopened_view_applies_replayed_events() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Online).await;

    let first = coordinator.open_view("rooms/a").unwrap();
    let event = h
        .store
        .publish_remote("rooms/a", Category::new("chat"), json!({ "text": "hello" }));
    eventually("remote event applied", || coordinator.timeline().len() == 1).await;
    assert_eq!(
        coordinator.apply_inbound(first, event.clone()),
        InboundOutcome::Duplicate
    );

    coordinator.open_view("rooms/b").unwrap();
    let again = coordinator.open_view("rooms/a").unwrap();
    assert!(coordinator.timeline().is_empty());

    // a backend replaying history on subscribe delivers it again
    assert_eq!(
        coordinator.apply_inbound(again, event.clone()),
        InboundOutcome::Applied
    );
    assert_eq!(coordinator.timeline().len(), 1);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn settle_overflow_is_reported() {
    let h = Harness::new();
    let mut config = SyncConfig {
        settle_ms: Some(1000),
        ..SyncConfig::default()
    };
    config.tasks.max_size = 1;
    let coordinator = h.start(config, ConnectionState::Online).await;
    let mut events = coordinator.events();

    coordinator.open_view("chat").unwrap();
    let first = h
        .store
        .publish_remote("chat", Category::new("chat"), json!({ "n": 1 }));
    let second = h
        .store
        .publish_remote("chat", Category::new("chat"), json!({ "n": 2 }));

    let failed = next_event(&mut events, |e| matches!(e, SyncEvent::TaskFailed { .. })).await;
    match failed {
        SyncEvent::TaskFailed { key, error } => {
            assert_eq!(key.as_str(), format!("settle:{}", second.event_id));
            assert!(error.contains("capacity 1"));
        }
        other => panic!("unexpected {other:?}"),
    }

    let settled = next_event(&mut events, |e| matches!(e, SyncEvent::Settled { .. })).await;
    assert!(matches!(
        settled,
        SyncEvent::Settled { key, timed_out: false } if key.as_str() == format!("settle:{}", first.event_id)
    ));
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_task_effect_ends_errored() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Online).await;
    let key = TaskKey::new("upload");

    let scheduled = coordinator.tasks().schedule(
        ScheduledTask::new(key.clone(), Duration::from_secs(1))
            .with_effect(async { Err::<(), _>("boom") }),
    );
    assert!(scheduled);

    eventually("task errored", || {
        coordinator.tasks().status(&key) == Some(TaskState::Errored)
    })
    .await;
    coordinator.shutdown().await;
}

// ========================================
// Lifecycle
// ========================================

#[tokio::test(start_paused = true)]
async fn connectivity_changes_are_broadcast() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Offline).await;
    let mut events = coordinator.events();

    coordinator.connectivity().set_online();

    let changed =
        next_event(&mut events, |e| matches!(e, SyncEvent::ConnectionChanged(_))).await;
    assert_eq!(changed, SyncEvent::ConnectionChanged(ConnectionState::Online));
    assert_eq!(coordinator.status().await.connection, ConnectionState::Online);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_refuses_further_work_and_keeps_the_queue() {
    let h = Harness::new();
    let coordinator = h.start(SyncConfig::default(), ConnectionState::Offline).await;
    coordinator.submit("chat", json!({})).await.unwrap();

    coordinator.shutdown().await;

    let after = coordinator.submit("chat", json!({})).await;
    assert!(matches!(after, Err(SyncError::Shutdown)));
    assert!(matches!(coordinator.flush().await, Err(SyncError::Shutdown)));
    assert!(
        h.storage
            .raw(&SyncConfig::default().offline.storage_key)
            .is_some()
    );
}
