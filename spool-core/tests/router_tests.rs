// ABOUTME: Tests for the conversation router - ledger idempotency, per-chat serialization, history
// ABOUTME: Includes the end-to-end echo flow through the bus in both directions

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use spool_core::agent::{AgentRequest, AgentRunner, EchoAgent};
use spool_core::bus::MessageBus;
use spool_core::config::{BusConfig, RouterConfig};
use spool_core::conversation::Role;
use spool_core::db::Database;
use spool_core::event::{ConversationKey, Direction, InboundEvent, OutboundEvent};
use spool_core::ledger::{LedgerDecision, RunOutcome};
use spool_core::queue::{QueueStatus, QueueStore};
use spool_core::router::{ConversationRouter, RouteOutcome};
use spool_core::tasks::TaskStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Agent that records how it was called
#[derive(Default)]
struct RecordingAgent {
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    history_lens: Mutex<Vec<usize>>,
    delay: Duration,
    fail: bool,
}

impl RecordingAgent {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRunner for RecordingAgent {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn run(&self, request: AgentRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.history_lens.lock().unwrap().push(request.history.len());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("model unavailable");
        }
        Ok(format!("echo:{}", request.event.content))
    }
}

struct Harness {
    db: Database,
    bus: MessageBus,
    router: Arc<ConversationRouter>,
    delivered: Arc<Mutex<Vec<OutboundEvent>>>,
}

fn harness(agent: Arc<dyn AgentRunner>) -> Harness {
    let db = Database::open_in_memory().expect("Failed to open in-memory database");
    let bus = MessageBus::new(
        QueueStore::new(db.connection()),
        BusConfig {
            retry_base_ms: 0,
            retry_max_ms: 0,
            ..BusConfig::default()
        },
    );
    let router = Arc::new(ConversationRouter::new(
        bus.clone(),
        db.connection(),
        agent,
        &RouterConfig::default(),
    ));
    bus.on_inbound(router.clone());

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    bus.on_outbound(Arc::new(move |event: OutboundEvent| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event);
            anyhow::Ok(())
        }
    }));

    Harness {
        db,
        bus,
        router,
        delivered,
    }
}

fn key(chat: &str) -> ConversationKey {
    ConversationKey::new("cli", chat)
}

#[tokio::test]
async fn test_end_to_end_echo_with_duplicate_enqueue() {
    let h = harness(Arc::new(EchoAgent));
    let m1 = InboundEvent::new("m1", "cli", "c1", "ana", "hello");

    h.bus.publish_inbound(m1.clone()).unwrap();
    h.bus.publish_inbound(m1).unwrap();

    assert_eq!(h.bus.drain_once(Direction::Inbound).await.unwrap(), 1);
    assert_eq!(h.bus.drain_once(Direction::Outbound).await.unwrap(), 1);

    let delivered = h.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].content, "echo:hello");
    assert_eq!(delivered[0].chat_id, "c1");
    assert_eq!(delivered[0].reply_to.as_deref(), Some("m1"));

    let history = h.router.conversations().recent_messages(&key("c1"), 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "hello");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "echo:hello");

    let stats = h.bus.stats().unwrap();
    assert_eq!(stats.count(Direction::Inbound, QueueStatus::Processed), 1);
    assert_eq!(stats.count(Direction::Outbound, QueueStatus::Processed), 1);
}

#[tokio::test]
async fn test_redelivery_reuses_cached_result() {
    let agent = Arc::new(RecordingAgent::default());
    let h = harness(agent.clone());
    let m1 = InboundEvent::new("m1", "cli", "c1", "ana", "hello");

    let first = h.router.route(m1.clone()).await.unwrap();
    let second = h.router.route(m1).await.unwrap();

    assert!(matches!(first, RouteOutcome::Executed(_)));
    match second {
        RouteOutcome::Cached(result) => assert_eq!(result.reply, "echo:hello"),
        other => panic!("expected cached result, got {:?}", other),
    }
    assert_eq!(agent.calls(), 1);

    // side effects were replayed idempotently, not duplicated
    assert_eq!(h.router.conversations().count_messages(&key("c1")).unwrap(), 2);
    assert_eq!(h.bus.store().count_active(Direction::Outbound).unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_invoke_agent_once() {
    let agent = Arc::new(RecordingAgent::slow(Duration::from_millis(50)));
    let h = harness(agent.clone());
    let m1 = InboundEvent::new("m1", "cli", "c1", "ana", "hello");

    let (a, b) = tokio::join!(h.router.route(m1.clone()), h.router.route(m1));
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(agent.calls(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, RouteOutcome::Executed(_)))
            .count(),
        1
    );
    // the per-chat queue holds the duplicate back until the first completes
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, RouteOutcome::Cached(_)))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_fresh_running_entry_skips_without_side_effects() {
    let agent = Arc::new(RecordingAgent::default());
    let h = harness(agent.clone());
    let now = Utc::now();
    let decision = h
        .router
        .ledger()
        .begin(&key("c1"), "m1", now - ChronoDuration::minutes(5), now)
        .unwrap();
    assert_eq!(decision, LedgerDecision::Started);

    let outcome = h
        .router
        .route(InboundEvent::new("m1", "cli", "c1", "ana", "hello"))
        .await
        .unwrap();
    assert_eq!(outcome, RouteOutcome::SkippedInFlight);
    assert_eq!(agent.calls(), 0);
    assert_eq!(h.router.conversations().count_messages(&key("c1")).unwrap(), 0);
    assert_eq!(h.bus.store().count_active(Direction::Outbound).unwrap(), 0);
}

#[tokio::test]
async fn test_stale_running_entry_is_reclaimed_and_run() {
    let agent = Arc::new(RecordingAgent::default());
    let h = harness(agent.clone());
    // default processing timeout is five minutes
    let abandoned_at = Utc::now() - ChronoDuration::minutes(30);
    h.router
        .ledger()
        .begin(
            &key("c1"),
            "m1",
            abandoned_at - ChronoDuration::minutes(5),
            abandoned_at,
        )
        .unwrap();

    let outcome = h
        .router
        .route(InboundEvent::new("m1", "cli", "c1", "ana", "hello"))
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::Executed(_)));
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
async fn test_agent_error_is_cached_as_reply() {
    let agent = Arc::new(RecordingAgent::failing());
    let h = harness(agent.clone());
    let m1 = InboundEvent::new("m1", "cli", "c1", "ana", "hello");

    let outcome = h.router.route(m1.clone()).await.unwrap();
    let result = match outcome {
        RouteOutcome::Executed(result) => result,
        other => panic!("expected execution, got {:?}", other),
    };
    assert_eq!(result.outcome, RunOutcome::Error);
    assert!(result.reply.starts_with("error: model unavailable"));

    // a failing run is not retried on redelivery
    assert!(matches!(h.router.route(m1).await.unwrap(), RouteOutcome::Cached(_)));
    assert_eq!(agent.calls(), 1);

    h.bus.drain_once(Direction::Outbound).await.unwrap();
    let delivered = h.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].content.starts_with("error:"));
}

#[tokio::test]
async fn test_same_conversation_is_serialized() {
    let agent = Arc::new(RecordingAgent::slow(Duration::from_millis(20)));
    let h = harness(agent.clone());

    let routes = (0..3).map(|i| {
        let router = h.router.clone();
        tokio::spawn(async move {
            router
                .route(InboundEvent::new(
                    format!("m{}", i),
                    "cli",
                    "c1",
                    "ana",
                    format!("hello {}", i),
                ))
                .await
        })
    });
    for handle in routes.collect::<Vec<_>>() {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(agent.calls(), 3);
    assert_eq!(agent.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(h.router.conversations().count_messages(&key("c1")).unwrap(), 6);
}

#[tokio::test]
async fn test_agent_sees_recent_history() {
    let agent = Arc::new(RecordingAgent::default());
    let h = harness(agent.clone());
    h.router
        .route(InboundEvent::new("m1", "cli", "c1", "ana", "first"))
        .await
        .unwrap();
    h.router
        .route(InboundEvent::new("m2", "cli", "c1", "ana", "second"))
        .await
        .unwrap();

    // first run sees only itself; second sees the first exchange plus itself
    assert_eq!(*agent.history_lens.lock().unwrap(), vec![1, 3]);
    assert!(h.router.conversations().get_chat(&key("c1")).unwrap().is_some());
}

#[tokio::test]
async fn test_task_event_logs_exactly_one_run() {
    let agent = Arc::new(RecordingAgent::default());
    let h = harness(agent.clone());
    let mut event = InboundEvent::new("task:t1:1000", "cli", "c1", "scheduler", "ping");
    event.task_id = Some("t1".to_string());

    h.router.route(event.clone()).await.unwrap();
    h.router.route(event).await.unwrap();

    let runs = TaskStore::new(h.db.connection()).list_runs("t1", 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].inbound_id, "task:t1:1000");
    assert_eq!(runs[0].outcome, RunOutcome::Success);
    assert_eq!(runs[0].preview.as_deref(), Some("echo:ping"));
}

#[tokio::test]
async fn test_idle_conversations_are_evicted() {
    let db = Database::open_in_memory().unwrap();
    let bus = MessageBus::new(QueueStore::new(db.connection()), BusConfig::default());
    let router = ConversationRouter::new(
        bus,
        db.connection(),
        Arc::new(EchoAgent),
        &RouterConfig {
            idle_evict_secs: 0,
            ..RouterConfig::default()
        },
    );
    router
        .route(InboundEvent::new("m1", "cli", "c1", "ana", "hi"))
        .await
        .unwrap();
    assert_eq!(router.tracked_conversations(), 1);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(router.evict_idle(), 1);
    assert_eq!(router.tracked_conversations(), 0);
}
