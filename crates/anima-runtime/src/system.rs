use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use anima_core::config::{ActorConfig, BreakerConfig, DlqConfig};
use anima_core::message::{ActorMessage, MessageType};
use anima_events::{EventStore, EventWriter};

use crate::actor::{run_message_loop, Actor, ActorContext};
use crate::breaker::CircuitBreaker;
use crate::error::{Result, RuntimeError};

/// A message the runtime gave up on, preserved for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub message: ActorMessage,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct DlqMetrics {
    pub current_size: usize,
    pub total_messages: u64,
    pub cleaned_messages: u64,
    pub max_size: usize,
}

struct Shared {
    name: String,
    routes: DashMap<String, mpsc::Sender<ActorMessage>>,
    breakers: DashMap<String, Mutex<CircuitBreaker>>,
    dlq: Mutex<VecDeque<DeadLetter>>,
    dlq_total: AtomicU64,
    dlq_cleaned: AtomicU64,
    background: Mutex<Vec<JoinHandle<()>>>,
    actor_cfg: ActorConfig,
    breaker_cfg: BreakerConfig,
    dlq_cfg: DlqConfig,
    events: Option<EventWriter>,
}

/// Cheap clonable handle actors use to reach the rest of the system.
#[derive(Clone)]
pub struct SystemHandle {
    shared: Arc<Shared>,
}

impl SystemHandle {
    /// Deliver a message to one actor's mailbox.
    ///
    /// With retries enabled, a full mailbox is retried with exponential
    /// backoff under the recipient's circuit breaker; final failure lands
    /// the message in the DLQ. Unrelated failures (unknown actor, closed
    /// mailbox) pass through without touching the breaker.
    pub async fn send(&self, actor_id: &str, msg: ActorMessage) -> Result<()> {
        let sender = self
            .shared
            .routes
            .get(actor_id)
            .map(|s| s.clone())
            .ok_or_else(|| RuntimeError::ActorNotFound {
                actor_id: actor_id.to_string(),
            })?;

        if !self.shared.actor_cfg.retry_enabled {
            return match sender.try_send(msg) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(RuntimeError::QueueFull {
                    actor_id: actor_id.to_string(),
                }),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(RuntimeError::MailboxClosed {
                    actor_id: actor_id.to_string(),
                }),
            };
        }

        let max_retries = self.shared.actor_cfg.max_retries;
        let max_delay = Duration::from_secs_f64(self.shared.actor_cfg.retry_max_delay_secs);
        let mut delay = Duration::from_secs_f64(self.shared.actor_cfg.retry_base_delay_secs);
        let mut attempt: u32 = 0;
        let mut msg = msg;

        loop {
            if self.shared.breaker_cfg.enabled && !self.breaker_allows(actor_id) {
                let err = RuntimeError::BreakerOpen {
                    actor_id: actor_id.to_string(),
                };
                error!(actor = actor_id, "circuit breaker open, message to DLQ");
                self.push_dead_letter(actor_id, msg, err.to_string());
                return Err(err);
            }

            match sender.try_send(msg) {
                Ok(()) => {
                    if self.shared.breaker_cfg.enabled {
                        self.breaker_record(actor_id, true);
                    }
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    let err = RuntimeError::MailboxClosed {
                        actor_id: actor_id.to_string(),
                    };
                    self.push_dead_letter(actor_id, returned, err.to_string());
                    return Err(err);
                }
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    if self.shared.breaker_cfg.enabled {
                        self.breaker_record(actor_id, false);
                    }
                    msg = returned;
                    attempt += 1;
                    if attempt > max_retries {
                        let err = RuntimeError::QueueFull {
                            actor_id: actor_id.to_string(),
                        };
                        error!(
                            actor = actor_id,
                            retries = max_retries,
                            "send failed after retries, message to DLQ"
                        );
                        self.push_dead_letter(actor_id, msg, err.to_string());
                        return Err(err);
                    }
                    warn!(
                        actor = actor_id,
                        attempt,
                        max = max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "mailbox full, retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }

    /// Concurrent fan-out to every registered actor except `exclude`.
    /// Failures are logged, never propagated; recipients see no ordering
    /// among themselves.
    pub async fn broadcast(&self, msg: ActorMessage, exclude: &[&str]) {
        let targets: Vec<String> = self
            .shared
            .routes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !exclude.contains(&id.as_str()))
            .collect();

        let sends = targets.iter().map(|id| {
            let msg = msg.clone();
            async move { (id.clone(), self.send(id, msg).await) }
        });
        for (id, result) in join_all(sends).await {
            if let Err(e) = result {
                warn!(actor = %id, error = %e, "broadcast delivery failed");
            }
        }
        debug!(
            message_type = %msg.message_type,
            recipients = targets.len(),
            "broadcast complete"
        );
    }

    pub fn events(&self) -> Option<&EventWriter> {
        self.shared.events.as_ref()
    }

    /// Spawn a fire-and-forget task the runtime tracks to completion on
    /// shutdown. Hot paths must route every spawned task through here.
    pub fn spawn_tracked<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut background = self.shared.background.lock().unwrap();
        background.retain(|t| !t.is_finished());
        background.push(handle);
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.dlq.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear_dead_letters(&self) -> usize {
        let mut dlq = self.shared.dlq.lock().unwrap();
        let count = dlq.len();
        dlq.clear();
        count
    }

    pub fn dlq_metrics(&self) -> DlqMetrics {
        DlqMetrics {
            current_size: self.shared.dlq.lock().unwrap().len(),
            total_messages: self.shared.dlq_total.load(Ordering::Relaxed),
            cleaned_messages: self.shared.dlq_cleaned.load(Ordering::Relaxed),
            max_size: self.shared.dlq_cfg.max_size,
        }
    }

    fn breaker_allows(&self, actor_id: &str) -> bool {
        let entry = self.shared.breakers.entry(actor_id.to_string()).or_insert_with(|| {
            Mutex::new(CircuitBreaker::new(
                &format!("actor_{actor_id}"),
                self.shared.breaker_cfg.failure_threshold,
                Duration::from_secs_f64(self.shared.breaker_cfg.recovery_timeout_secs),
            ))
        });
        let mut breaker = entry.lock().unwrap();
        breaker.allow()
    }

    fn breaker_record(&self, actor_id: &str, success: bool) {
        if let Some(entry) = self.shared.breakers.get(actor_id) {
            let mut breaker = entry.lock().unwrap();
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    fn push_dead_letter(&self, actor_id: &str, message: ActorMessage, error: String) {
        let dead_letter = DeadLetter {
            timestamp: Utc::now(),
            actor_id: actor_id.to_string(),
            message: message.clone(),
            error: error.clone(),
        };
        let size = {
            let mut dlq = self.shared.dlq.lock().unwrap();
            dlq.push_back(dead_letter);
            dlq.len()
        };
        self.shared.dlq_total.fetch_add(1, Ordering::Relaxed);
        error!(
            actor = actor_id,
            message_id = %message.message_id,
            error = %error,
            "message quarantined to DLQ"
        );
        if size as f64 > self.shared.dlq_cfg.max_size as f64 * 0.9 {
            warn!(size, max = self.shared.dlq_cfg.max_size, "DLQ is 90% full");
        }

        if let Some(writer) = self.shared.events.clone() {
            let stream = format!("dlq_{actor_id}");
            let payload = json!({
                "actor_id": actor_id,
                "message_id": message.message_id,
                "message_type": message.message_type,
                "error": error,
                "payload": message.payload,
            });
            let correlation = message.message_id.clone();
            self.spawn_tracked(async move {
                if let Err(e) = writer
                    .append(&stream, "DeadLetterQueuedEvent", payload, Some(&correlation))
                    .await
                {
                    error!(error = %e, "failed to record DeadLetterQueuedEvent");
                }
            });
        }
    }
}

struct PendingActor {
    actor: Box<dyn Actor>,
    rx: mpsc::Receiver<ActorMessage>,
}

/// Owner of the actor registry and of every actor task.
pub struct ActorSystem {
    shared: Arc<Shared>,
    pending: Mutex<Vec<PendingActor>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl ActorSystem {
    pub fn new(
        name: &str,
        actor_cfg: ActorConfig,
        breaker_cfg: BreakerConfig,
        dlq_cfg: DlqConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                routes: DashMap::new(),
                breakers: DashMap::new(),
                dlq: Mutex::new(VecDeque::new()),
                dlq_total: AtomicU64::new(0),
                dlq_cleaned: AtomicU64::new(0),
                background: Mutex::new(Vec::new()),
                actor_cfg,
                breaker_cfg,
                dlq_cfg,
                events: None,
            }),
            pending: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            janitor: Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    /// Attach the event store the runtime reports DLQ events to. Must be
    /// called before `start`.
    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("with_event_store must be called before the system is shared");
        shared.events = Some(EventWriter::new(store));
        self
    }

    pub fn handle(&self) -> SystemHandle {
        SystemHandle {
            shared: self.shared.clone(),
        }
    }

    /// Register an actor under its unique id. Fails if the id is taken.
    /// When the system is already running the actor starts immediately.
    pub async fn register(&self, actor: Box<dyn Actor>) -> Result<()> {
        let actor_id = actor.actor_id().to_string();
        if self.shared.routes.contains_key(&actor_id) {
            return Err(RuntimeError::AlreadyRegistered { actor_id });
        }

        let (tx, rx) = mpsc::channel(self.shared.actor_cfg.queue_size);
        self.shared.routes.insert(actor_id.clone(), tx);
        info!(system = %self.shared.name, actor = %actor_id, "actor registered");

        if self.is_running.load(Ordering::Relaxed) {
            self.start_actor(PendingActor { actor, rx }).await?;
        } else {
            self.pending.lock().unwrap().push(PendingActor { actor, rx });
        }
        Ok(())
    }

    /// Start every registered actor, then the DLQ janitor.
    pub async fn start(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::Relaxed) {
            warn!(system = %self.shared.name, "actor system already running");
            return Ok(());
        }
        info!(system = %self.shared.name, "starting actor system");

        let pending: Vec<PendingActor> = self.pending.lock().unwrap().drain(..).collect();
        let count = pending.len();
        for entry in pending {
            self.start_actor(entry).await?;
        }

        if self.shared.dlq_cfg.cleanup_interval_secs > 0 {
            let handle = self.handle();
            let interval = Duration::from_secs(self.shared.dlq_cfg.cleanup_interval_secs);
            let janitor = tokio::spawn(async move { dlq_cleanup_loop(handle, interval).await });
            *self.janitor.lock().unwrap() = Some(janitor);
        }

        info!(system = %self.shared.name, actors = count, "actor system started");
        Ok(())
    }

    async fn start_actor(&self, entry: PendingActor) -> Result<()> {
        let PendingActor { mut actor, rx } = entry;
        let actor_id = actor.actor_id().to_string();
        let ctx = ActorContext::new(actor_id.clone(), self.handle());

        actor
            .initialize(&ctx)
            .await
            .map_err(|e| RuntimeError::InitFailed {
                actor_id: actor_id.clone(),
                reason: e.to_string(),
            })?;

        let wake = Duration::from_secs_f64(self.shared.actor_cfg.message_timeout_secs);
        let task = tokio::spawn(run_message_loop(actor, rx, ctx, wake));
        self.tasks.lock().unwrap().insert(actor_id, task);
        Ok(())
    }

    /// Stop the system: drain tracked background tasks, stop the janitor,
    /// signal every actor to shut down, await each within `timeout`, then
    /// cancel stragglers.
    pub async fn stop(&self, timeout: Duration) {
        let background: Vec<JoinHandle<()>> = {
            let mut tasks = self.shared.background.lock().unwrap();
            tasks.drain(..).collect()
        };
        if !background.is_empty() {
            info!(count = background.len(), "waiting for background tasks");
            join_all(background).await;
        }

        if !self.is_running.swap(false, Ordering::Relaxed) {
            warn!(system = %self.shared.name, "actor system not running");
            return;
        }
        info!(system = %self.shared.name, "stopping actor system");

        if let Some(janitor) = self.janitor.lock().unwrap().take() {
            janitor.abort();
        }

        let shutdown = ActorMessage::control(MessageType::Shutdown);
        for entry in self.shared.routes.iter() {
            // Best-effort: a full mailbox is handled by the cancel below.
            let _ = entry.value().try_send(shutdown.clone());
        }

        let tasks: Vec<(String, JoinHandle<()>)> =
            self.tasks.lock().unwrap().drain().collect();
        let deadline = tokio::time::Instant::now() + timeout;
        for (actor_id, mut task) in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut task).await {
                Ok(_) => {}
                Err(_) => {
                    error!(actor = %actor_id, "shutdown timeout, cancelling actor task");
                    task.abort();
                }
            }
        }
        self.shared.routes.clear();
        info!(system = %self.shared.name, "actor system stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }
}

/// Trim the DLQ to its configured cap, oldest first, and log metrics.
async fn dlq_cleanup_loop(handle: SystemHandle, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let max = handle.shared.dlq_cfg.max_size;
        let removed = {
            let mut dlq = handle.shared.dlq.lock().unwrap();
            let excess = dlq.len().saturating_sub(max);
            for _ in 0..excess {
                dlq.pop_front();
            }
            excess
        };
        if removed > 0 {
            handle
                .shared
                .dlq_cleaned
                .fetch_add(removed as u64, Ordering::Relaxed);
            warn!(removed, "DLQ janitor trimmed old messages");
        }
        if handle.shared.dlq_cfg.metrics_enabled {
            let metrics = handle.dlq_metrics();
            info!(
                current = metrics.current_size,
                total = metrics.total_messages,
                cleaned = metrics.cleaned_messages,
                "DLQ metrics"
            );
        }
    }
}
