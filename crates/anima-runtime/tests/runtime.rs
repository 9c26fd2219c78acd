use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use anima_core::config::{ActorConfig, BreakerConfig, DlqConfig};
use anima_core::message::{ActorMessage, MessageType};
use anima_events::{EventStore, MemoryEventStore};
use anima_runtime::{Actor, ActorContext, ActorSystem, Result, RuntimeError};

/// Records everything it handles; optionally sleeps to simulate a slow
/// consumer.
struct Recorder {
    id: String,
    seen: Arc<Mutex<Vec<ActorMessage>>>,
    delay: Option<Duration>,
}

impl Recorder {
    fn new(id: &str) -> (Self, Arc<Mutex<Vec<ActorMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                id: id.to_string(),
                seen: seen.clone(),
                delay: None,
            },
            seen,
        )
    }

    fn slow(id: &str, delay: Duration) -> (Self, Arc<Mutex<Vec<ActorMessage>>>) {
        let (mut actor, seen) = Self::new(id);
        actor.delay = Some(delay);
        (actor, seen)
    }
}

#[async_trait]
impl Actor for Recorder {
    fn actor_id(&self) -> &str {
        &self.id
    }

    async fn handle(&mut self, msg: ActorMessage, _ctx: &ActorContext) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.seen.lock().unwrap().push(msg);
        Ok(())
    }
}

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn fast_actor_cfg() -> ActorConfig {
    ActorConfig {
        queue_size: 1,
        message_timeout_secs: 0.05,
        shutdown_timeout_secs: 1.0,
        retry_enabled: true,
        max_retries: 3,
        retry_base_delay_secs: 0.05,
        retry_max_delay_secs: 0.2,
    }
}

fn no_breaker() -> BreakerConfig {
    BreakerConfig {
        enabled: false,
        ..Default::default()
    }
}

fn quiet_dlq() -> DlqConfig {
    DlqConfig {
        max_size: 100,
        cleanup_interval_secs: 0,
        metrics_enabled: false,
    }
}

fn message(n: i64) -> ActorMessage {
    ActorMessage::new(MessageType::Ping, json!({ "n": n }))
}

#[tokio::test]
async fn mailbox_preserves_fifo_order() {
    init_tracing();
    let system = ActorSystem::new(
        "test",
        ActorConfig {
            queue_size: 32,
            ..fast_actor_cfg()
        },
        no_breaker(),
        quiet_dlq(),
    );
    let (actor, seen) = Recorder::new("recorder");
    system.register(Box::new(actor)).await.unwrap();
    system.start().await.unwrap();

    let handle = system.handle();
    for n in 0..20 {
        handle.send("recorder", message(n)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let order: Vec<i64> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|m| m.payload["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());
    system.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let system = ActorSystem::new("test", fast_actor_cfg(), no_breaker(), quiet_dlq());
    let (a, _) = Recorder::new("dup");
    let (b, _) = Recorder::new("dup");
    system.register(Box::new(a)).await.unwrap();
    let err = system.register(Box::new(b)).await.unwrap_err();
    assert!(matches!(err, RuntimeError::AlreadyRegistered { .. }));
}

#[tokio::test]
async fn send_to_unknown_actor_fails() {
    let system = ActorSystem::new("test", fast_actor_cfg(), no_breaker(), quiet_dlq());
    let err = system
        .handle()
        .send("ghost", message(0))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ActorNotFound { .. }));
}

#[tokio::test]
async fn retry_succeeds_when_consumer_drains_in_time() {
    let system = ActorSystem::new("test", fast_actor_cfg(), no_breaker(), quiet_dlq());
    let (actor, seen) = Recorder::slow("slow", Duration::from_millis(80));
    system.register(Box::new(actor)).await.unwrap();
    system.start().await.unwrap();

    let handle = system.handle();
    // First message is dequeued immediately and handled slowly; the second
    // occupies the single slot; the third succeeds after backoff once the
    // slot frees up.
    handle.send("slow", message(0)).await.unwrap();
    handle.send("slow", message(1)).await.unwrap();
    handle.send("slow", message(2)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert!(handle.dlq_metrics().current_size == 0);
    system.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn exhausted_retries_land_in_dlq_with_events() {
    init_tracing();
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new(10_000, 8));
    let system = ActorSystem::new("test", fast_actor_cfg(), no_breaker(), quiet_dlq())
        .with_event_store(store.clone());
    let (actor, _) = Recorder::new("stalled");
    // Registered but never started: the mailbox fills and nothing drains.
    system.register(Box::new(actor)).await.unwrap();

    let handle = system.handle();
    handle.send("stalled", message(0)).await.unwrap();
    let err = handle.send("stalled", message(1)).await.unwrap_err();
    assert!(matches!(err, RuntimeError::QueueFull { .. }));
    let err = handle.send("stalled", message(2)).await.unwrap_err();
    assert!(matches!(err, RuntimeError::QueueFull { .. }));

    // stop() awaits the tracked DLQ event writers.
    system.stop(Duration::from_secs(1)).await;

    let letters = handle.dead_letters();
    assert_eq!(letters.len(), 2);
    assert_eq!(letters[0].actor_id, "stalled");

    let events = store.get_stream("dlq_stalled", 0).await.unwrap();
    assert_eq!(events.len(), 2);
    let versions: Vec<u32> = events.iter().map(|e| e.version()).collect();
    assert_eq!(versions, vec![0, 1]);
    assert!(events
        .iter()
        .all(|e| e.event_type() == "DeadLetterQueuedEvent"));
}

#[tokio::test]
async fn breaker_opens_and_rejects_while_open() {
    let system = ActorSystem::new(
        "test",
        ActorConfig {
            max_retries: 0,
            ..fast_actor_cfg()
        },
        BreakerConfig {
            enabled: true,
            failure_threshold: 2,
            recovery_timeout_secs: 0.1,
        },
        quiet_dlq(),
    );
    let (actor, _) = Recorder::new("jammed");
    system.register(Box::new(actor)).await.unwrap();

    let handle = system.handle();
    handle.send("jammed", message(0)).await.unwrap();
    // Two consecutive queue-full failures trip the breaker.
    assert!(matches!(
        handle.send("jammed", message(1)).await.unwrap_err(),
        RuntimeError::QueueFull { .. }
    ));
    assert!(matches!(
        handle.send("jammed", message(2)).await.unwrap_err(),
        RuntimeError::QueueFull { .. }
    ));
    // Open: rejected without an enqueue attempt.
    assert!(matches!(
        handle.send("jammed", message(3)).await.unwrap_err(),
        RuntimeError::BreakerOpen { .. }
    ));

    // After the recovery timeout the half-open probe reaches the mailbox
    // again (and fails, since nothing drained).
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(matches!(
        handle.send("jammed", message(4)).await.unwrap_err(),
        RuntimeError::QueueFull { .. }
    ));
    system.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn broadcast_excludes_and_collects_failures() {
    let system = ActorSystem::new(
        "test",
        ActorConfig {
            queue_size: 8,
            ..fast_actor_cfg()
        },
        no_breaker(),
        quiet_dlq(),
    );
    let (a, seen_a) = Recorder::new("a");
    let (b, seen_b) = Recorder::new("b");
    let (c, seen_c) = Recorder::new("c");
    system.register(Box::new(a)).await.unwrap();
    system.register(Box::new(b)).await.unwrap();
    system.register(Box::new(c)).await.unwrap();
    system.start().await.unwrap();

    system.handle().broadcast(message(7), &["b"]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(seen_a.lock().unwrap().len(), 1);
    assert_eq!(seen_b.lock().unwrap().len(), 0);
    assert_eq!(seen_c.lock().unwrap().len(), 1);
    system.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn dlq_janitor_trims_to_cap() {
    let system = ActorSystem::new(
        "test",
        ActorConfig {
            max_retries: 0,
            retry_base_delay_secs: 0.01,
            ..fast_actor_cfg()
        },
        no_breaker(),
        DlqConfig {
            max_size: 2,
            cleanup_interval_secs: 1,
            metrics_enabled: false,
        },
    );
    let (actor, _) = Recorder::slow("full", Duration::from_millis(500));
    system.register(Box::new(actor)).await.unwrap();
    system.start().await.unwrap();

    let handle = system.handle();
    // The slow consumer holds the loop while the single slot is occupied,
    // so the later sends overflow straight to the DLQ.
    for n in 0..6 {
        let _ = handle.send("full", message(n)).await;
    }
    tokio::time::sleep(Duration::from_millis(1300)).await;

    let metrics = handle.dlq_metrics();
    assert!(
        metrics.current_size <= 2,
        "janitor left {} entries",
        metrics.current_size
    );
    assert!(metrics.cleaned_messages > 0);
    system.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn stop_sends_shutdown_and_actors_drain() {
    let system = ActorSystem::new(
        "test",
        ActorConfig {
            queue_size: 16,
            ..fast_actor_cfg()
        },
        no_breaker(),
        quiet_dlq(),
    );
    let (actor, seen) = Recorder::new("worker");
    system.register(Box::new(actor)).await.unwrap();
    system.start().await.unwrap();

    let handle = system.handle();
    for n in 0..3 {
        handle.send("worker", message(n)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    system.stop(Duration::from_secs(2)).await;

    assert_eq!(seen.lock().unwrap().len(), 3);
    assert!(!system.is_running());
}
