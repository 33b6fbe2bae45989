// ABOUTME: Tests for the message bus - flow control, retry/dead-letter resolution, and loop lifecycle
// ABOUTME: Uses closure handlers and drain_once for deterministic processing, real loops for start/stop

use chrono::{Duration as ChronoDuration, Utc};
use spool_core::bus::{Admission, MessageBus};
use spool_core::config::BusConfig;
use spool_core::db::Database;
use spool_core::event::{Direction, InboundEvent, OutboundEvent};
use spool_core::queue::{NewMessage, QueueStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_config() -> BusConfig {
    BusConfig {
        poll_interval_ms: 20,
        max_attempts: 3,
        retry_base_ms: 0,
        retry_max_ms: 0,
        ..BusConfig::default()
    }
}

fn create_bus(config: BusConfig) -> MessageBus {
    let db = Database::open_in_memory().expect("Failed to open in-memory database");
    MessageBus::new(spool_core::queue::QueueStore::new(db.connection()), config)
}

fn event(id: &str, chat: &str) -> InboundEvent {
    InboundEvent::new(id, "cli", chat, "ana", format!("message {}", id))
}

/// Register an inbound handler that counts calls and fails the first `failures` of them
fn counting_handler(bus: &MessageBus, failures: usize) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    bus.on_inbound(Arc::new(move |_event: InboundEvent| {
        let seen = seen.clone();
        async move {
            let call = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                anyhow::bail!("transient failure {}", call);
            }
            anyhow::Ok(())
        }
    }));
    calls
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_duplicate_publish_collapses_to_one_row() {
    let bus = create_bus(test_config());
    let first = bus.publish_inbound(event("m1", "c1")).unwrap();
    let second = bus.publish_inbound(event("m1", "c1")).unwrap();

    assert!(first.inserted);
    assert_eq!(first.admission, Admission::Accepted);
    assert!(!second.inserted);
    assert_eq!(second.admission, Admission::Duplicate);
    assert_eq!(second.queue_id, first.queue_id);
    assert_eq!(second.status, QueueStatus::Pending);
    assert_eq!(bus.store().count_active(Direction::Inbound).unwrap(), 1);
}

#[tokio::test]
async fn test_handler_succeeding_on_third_attempt_ends_processed() {
    let bus = create_bus(test_config());
    let calls = counting_handler(&bus, 2);
    let published = bus.publish_inbound(event("m1", "c1")).unwrap();

    for _ in 0..3 {
        assert_eq!(bus.drain_once(Direction::Inbound).await.unwrap(), 1);
    }

    let row = bus.store().get(&published.queue_id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Processed);
    assert_eq!(row.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(bus.list_dead_letter(None, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_always_failing_handler_dead_letters_after_max_attempts() {
    let bus = create_bus(BusConfig {
        max_attempts: 2,
        ..test_config()
    });
    let calls = counting_handler(&bus, usize::MAX);
    let published = bus.publish_inbound(event("m1", "c1")).unwrap();

    bus.drain_once(Direction::Inbound).await.unwrap();
    bus.drain_once(Direction::Inbound).await.unwrap();
    // nothing left to retry
    assert_eq!(bus.drain_once(Direction::Inbound).await.unwrap(), 0);

    let row = bus.store().get(&published.queue_id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::DeadLetter);
    assert_eq!(row.attempts, 2);
    assert!(row.last_error.unwrap().contains("transient failure 2"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(bus.list_dead_letter(Some(Direction::Inbound), 10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_retry_delay_defers_the_next_attempt() {
    let bus = create_bus(BusConfig {
        retry_base_ms: 60_000,
        retry_max_ms: 120_000,
        ..test_config()
    });
    counting_handler(&bus, 1);
    let published = bus.publish_inbound(event("m1", "c1")).unwrap();

    let before = Utc::now();
    bus.drain_once(Direction::Inbound).await.unwrap();
    let row = bus.store().get(&published.queue_id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Pending);
    assert!(row.available_at >= before + ChronoDuration::seconds(59));
    assert_eq!(bus.drain_once(Direction::Inbound).await.unwrap(), 0);
}

#[tokio::test]
async fn test_handler_timeout_counts_as_failure() {
    let bus = create_bus(BusConfig {
        processing_timeout_ms: 50,
        ..test_config()
    });
    bus.on_inbound(Arc::new(|_event: InboundEvent| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        anyhow::Ok(())
    }));
    let published = bus.publish_inbound(event("m1", "c1")).unwrap();

    bus.drain_once(Direction::Inbound).await.unwrap();
    let row = bus.store().get(&published.queue_id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Pending);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_error.as_deref(), Some("handler timed out after 50ms"));
}

#[tokio::test]
async fn test_malformed_payload_is_dead_lettered_without_calling_handlers() {
    let bus = create_bus(test_config());
    let calls = counting_handler(&bus, 0);
    let out = bus
        .store()
        .enqueue(&NewMessage::new(Direction::Inbound, "not json", 3), Utc::now())
        .unwrap();

    assert_eq!(bus.drain_once(Direction::Inbound).await.unwrap(), 1);
    let row = bus.store().get(&out.queue_id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::DeadLetter);
    assert!(row.last_error.unwrap().starts_with("invalid payload"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handlers_run_in_registration_order() {
    let bus = create_bus(test_config());
    let log = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let log = log.clone();
        bus.on_inbound(Arc::new(move |event: InboundEvent| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{}:{}", name, event.id));
                anyhow::Ok(())
            }
        }));
    }
    bus.publish_inbound(event("m1", "c1")).unwrap();
    bus.publish_inbound(event("m2", "c1")).unwrap();
    bus.drain_once(Direction::Inbound).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["first:m1", "second:m1", "first:m2", "second:m2"]
    );
}

#[tokio::test]
async fn test_rows_wait_while_no_handler_is_registered() {
    let bus = create_bus(test_config());
    let published = bus.publish_inbound(event("m1", "c1")).unwrap();
    assert_eq!(bus.drain_once(Direction::Inbound).await.unwrap(), 0);
    let row = bus.store().get(&published.queue_id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Pending);
    assert_eq!(row.attempts, 0);
}

#[tokio::test]
async fn test_backlog_ceiling_dead_letters_on_arrival() {
    let bus = create_bus(BusConfig {
        max_pending_inbound: 2,
        overload_threshold: 100,
        ..test_config()
    });
    bus.publish_inbound(event("m1", "c1")).unwrap();
    bus.publish_inbound(event("m2", "c2")).unwrap();
    let rejected = bus.publish_inbound(event("m3", "c3")).unwrap();

    assert_eq!(rejected.admission, Admission::RejectedBacklog);
    assert_eq!(rejected.status, QueueStatus::DeadLetter);
    let row = bus.store().get(&rejected.queue_id).unwrap().unwrap();
    assert!(row.last_error.unwrap().contains("backlog limit reached"));

    // the outbound direction has its own ceiling
    let reply = OutboundEvent::reply(&event("m3", "c3"), "hi");
    assert_eq!(bus.publish_outbound(reply).unwrap().admission, Admission::Accepted);

    // re-publishing the rejected event is a duplicate, not a second rejection
    let again = bus.publish_inbound(event("m3", "c3")).unwrap();
    assert_eq!(again.admission, Admission::Duplicate);
    assert_eq!(again.queue_id, rejected.queue_id);
}

#[tokio::test]
async fn test_rate_limit_is_per_conversation() {
    let bus = create_bus(BusConfig {
        rate_limit_max: 2,
        ..test_config()
    });
    assert_eq!(bus.publish_inbound(event("m1", "noisy")).unwrap().admission, Admission::Accepted);
    assert_eq!(bus.publish_inbound(event("m2", "noisy")).unwrap().admission, Admission::Accepted);

    let limited = bus.publish_inbound(event("m3", "noisy")).unwrap();
    assert_eq!(limited.admission, Admission::RejectedRateLimit);
    let row = bus.store().get(&limited.queue_id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::DeadLetter);
    assert!(row.last_error.unwrap().contains("rate limit exceeded for cli:noisy"));

    assert_eq!(bus.publish_inbound(event("m4", "quiet")).unwrap().admission, Admission::Accepted);
}

#[tokio::test]
async fn test_overload_defers_instead_of_rejecting() {
    let bus = create_bus(BusConfig {
        overload_threshold: 1,
        overload_backoff_ms: 60_000,
        ..test_config()
    });
    let calls = counting_handler(&bus, 0);
    let first = bus.publish_inbound(event("m1", "c1")).unwrap();
    // at the threshold is not yet over it
    let second = bus.publish_inbound(event("m2", "c2")).unwrap();
    let third = bus.publish_inbound(event("m3", "c3")).unwrap();

    assert_eq!(first.admission, Admission::Accepted);
    assert_eq!(second.admission, Admission::Accepted);
    assert_eq!(third.admission, Admission::Deferred);
    assert_eq!(third.status, QueueStatus::Pending);
    let deferred = bus.store().get(&third.queue_id).unwrap().unwrap();
    assert!(deferred.available_at > deferred.created_at + ChronoDuration::seconds(59));

    assert_eq!(bus.drain_once(Direction::Inbound).await.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_replay_returns_dead_letter_to_processing() {
    let bus = create_bus(BusConfig {
        max_attempts: 1,
        ..test_config()
    });
    let calls = counting_handler(&bus, 1);
    let published = bus.publish_inbound(event("m1", "c1")).unwrap();
    bus.drain_once(Direction::Inbound).await.unwrap();
    assert_eq!(
        bus.store().get(&published.queue_id).unwrap().unwrap().status,
        QueueStatus::DeadLetter
    );

    let replay = bus.replay_dead_letter(&published.queue_id).unwrap();
    assert_eq!(replay.replayed, 1);
    assert_eq!(bus.replay_dead_letter(&published.queue_id).unwrap().replayed, 0);

    bus.drain_once(Direction::Inbound).await.unwrap();
    let row = bus.store().get(&published.queue_id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Processed);
    assert_eq!(row.replay_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_loops_process_published_events_in_both_directions() {
    let bus = create_bus(test_config());
    let inbound_calls = counting_handler(&bus, 0);
    let outbound_calls = Arc::new(AtomicUsize::new(0));
    let seen = outbound_calls.clone();
    bus.on_outbound(Arc::new(move |_event: OutboundEvent| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        }
    }));

    bus.start().await.unwrap();
    bus.start().await.unwrap();
    assert!(bus.is_running());

    let inbound = event("m1", "c1");
    bus.publish_inbound(inbound.clone()).unwrap();
    bus.publish_outbound(OutboundEvent::reply(&inbound, "echo")).unwrap();

    wait_for("inbound handler", || inbound_calls.load(Ordering::SeqCst) == 1).await;
    wait_for("outbound handler", || outbound_calls.load(Ordering::SeqCst) == 1).await;

    bus.stop().await;
    bus.stop().await;
    assert!(!bus.is_running());

    let stats = bus.stats().unwrap();
    assert_eq!(stats.count(Direction::Inbound, QueueStatus::Processed), 1);
    assert_eq!(stats.count(Direction::Outbound, QueueStatus::Processed), 1);
}

#[tokio::test]
async fn test_start_recovers_rows_left_processing_by_a_crash() {
    let db = Database::open_in_memory().unwrap();
    let store = spool_core::queue::QueueStore::new(db.connection());
    let crashed_at = Utc::now() - ChronoDuration::minutes(10);

    // simulate a worker that claimed a row and died
    let envelope = spool_core::event::Envelope::Inbound(event("m1", "c1"));
    let out = store
        .enqueue(
            &NewMessage::new(Direction::Inbound, envelope.encode().unwrap(), 3),
            crashed_at,
        )
        .unwrap();
    assert!(store.claim(&out.queue_id, crashed_at).unwrap());

    let bus = MessageBus::new(
        store.clone(),
        BusConfig {
            processing_timeout_ms: 60_000,
            ..test_config()
        },
    );
    let calls = counting_handler(&bus, 0);
    bus.start().await.unwrap();

    wait_for("recovered row to be processed", || calls.load(Ordering::SeqCst) == 1).await;
    bus.stop().await;

    let row = store.get(&out.queue_id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Processed);
    // the crashed attempt was charged
    assert_eq!(row.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_running_bus_sweeps_rows_stuck_in_processing() {
    let db = Database::open_in_memory().unwrap();
    let store = spool_core::queue::QueueStore::new(db.connection());

    // claimed moments ago by a worker that died; too fresh for the startup recovery
    let envelope = spool_core::event::Envelope::Inbound(event("m1", "c1"));
    let out = store
        .enqueue(
            &NewMessage::new(Direction::Inbound, envelope.encode().unwrap(), 3),
            Utc::now(),
        )
        .unwrap();
    assert!(store.claim(&out.queue_id, Utc::now()).unwrap());

    let bus = MessageBus::new(
        store.clone(),
        BusConfig {
            processing_timeout_ms: 500,
            ..test_config()
        },
    );
    let calls = counting_handler(&bus, 0);
    bus.start().await.unwrap();
    assert_eq!(
        store.get(&out.queue_id).unwrap().unwrap().status,
        QueueStatus::Processing
    );

    wait_for("swept row to be processed", || calls.load(Ordering::SeqCst) == 1).await;
    bus.stop().await;

    let row = store.get(&out.queue_id).unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Processed);
    assert_eq!(row.attempts, 1);
}
