//! DLQ handler: parking, retry-in-place, poison promotion, replay, purge.
//!
//! Retries run through the unified retry executor so DLQ traffic shares
//! the same budget and circuit breaker discipline as live traffic.

use super::message::{DlqConfig, DlqMessage, DlqReason, MessageStatus};
use super::store::{DlqError, DlqStats, DlqStore};
use crate::backoff::BackoffCalculator;
use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};
use crate::budget::{RetryBudget, RetryBudgetConfig, RetryBudgetSnapshot};
use crate::bus::EventBus;
use crate::error::{BoxError, ResilienceError};
use crate::policies::{self, RetryPolicy};
use crate::retry::RetryExecutor;
use crate::store::KeyValueStore;
use crate::time::{SystemWallClock, WallClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Consumer invoked when a parked message is retried.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &Value) -> Result<(), BoxError>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(&self, payload: &Value) -> Result<(), BoxError> {
        (self.0)(payload.clone()).await
    }
}

/// Maps a DLQ reason to the retry policy used for its redelivery.
pub fn policy_for_reason(reason: DlqReason) -> RetryPolicy {
    match reason {
        DlqReason::NetworkError | DlqReason::Timeout => policies::NETWORK,
        DlqReason::WebhookFailed => policies::WEBHOOK,
        DlqReason::ExecutionFailed => policies::CRITICAL,
        DlqReason::ValidationFailed => policies::VALIDATION,
        DlqReason::AuthError => policies::AUTH,
        _ => policies::STANDARD,
    }
}

pub struct DlqHandler {
    config: DlqConfig,
    store: DlqStore,
    bus: Option<Arc<dyn EventBus>>,
    executor: RetryExecutor<BoxError>,
    budget: Arc<RetryBudget>,
    breaker: Arc<CircuitBreaker<BoxError>>,
    handlers: StdRwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    in_flight: StdMutex<HashSet<String>>,
    clock: Arc<dyn WallClock>,
    shutdown: watch::Sender<bool>,
    tasks: TokioMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for DlqHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlqHandler").field("config", &self.config).finish()
    }
}

impl DlqHandler {
    pub fn new(store: Arc<dyn KeyValueStore>, config: DlqConfig) -> Self {
        let budget = Arc::new(RetryBudget::new(RetryBudgetConfig {
            budget_percent: 20.0,
            min_requests: 10,
            window: Duration::from_secs(60),
            ..Default::default()
        }));
        let mut breaker_config = CircuitBreakerConfig::default();
        breaker_config.failure_threshold = 5;
        breaker_config.success_threshold = 2;
        breaker_config.open_timeout = Duration::from_secs(300);
        let breaker = Arc::new(CircuitBreaker::new(format!("dlq_{}", config.name), breaker_config));
        let executor = RetryExecutor::new()
            .with_budget(budget.clone())
            .with_breaker(breaker.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            store: DlqStore::new(store, config.key_prefix.clone(), config.ttl),
            config,
            bus: None,
            executor,
            budget,
            breaker,
            handlers: StdRwLock::new(HashMap::new()),
            in_flight: StdMutex::new(HashSet::new()),
            clock: Arc::new(SystemWallClock),
            shutdown,
            tasks: TokioMutex::new(Vec::new()),
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the retry executor (tests swap in instant sleepers).
    pub fn with_executor(mut self, executor: RetryExecutor<BoxError>) -> Self {
        self.executor = executor;
        self
    }

    pub fn register_handler(&self, queue: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let queue = queue.into();
        tracing::info!(queue, "DLQ handler registered");
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(queue, handler);
    }

    pub fn store(&self) -> &DlqStore {
        &self.store
    }

    /// Park a failed message.
    pub async fn send_to_dlq(
        &self,
        queue: &str,
        original_message: Value,
        reason: DlqReason,
        error: impl std::fmt::Display,
        retry_count: u32,
        metadata: HashMap<String, Value>,
    ) -> Result<String, DlqError> {
        let now = self.clock.now_utc();
        let message_id =
            format!("{queue}:{}:{}", now.timestamp_millis(), Uuid::new_v4().simple());

        let message = DlqMessage {
            message_id: message_id.clone(),
            queue_name: queue.to_string(),
            original_message,
            reason,
            error_details: error.to_string(),
            retry_count,
            max_retries: self.config.max_retries,
            first_failure_time: now,
            last_failure_time: now,
            next_retry_time: self.next_retry_time(reason, retry_count, now),
            status: MessageStatus::Pending,
            metadata,
            error_history: Vec::new(),
        };

        self.store.put(&message).await?;
        counter!("dlq_messages_total", "queue" => queue.to_string(), "reason" => reason.as_str())
            .increment(1);
        self.update_size_gauge(queue).await;
        self.publish_event(&message, "message_added").await;

        tracing::warn!(
            queue,
            %message_id,
            reason = reason.as_str(),
            retry_count,
            "message sent to DLQ"
        );
        Ok(message_id)
    }

    /// Retry one parked message through the resilience stack. Returns true
    /// when the handler succeeded and the message left the queue.
    pub async fn retry(&self, queue: &str, message_id: &str) -> Result<bool, DlqError> {
        let Some(_guard) = self.claim(queue, message_id) else {
            tracing::debug!(queue, message_id, "retry already in flight");
            return Ok(false);
        };

        let Some(mut message) = self.store.get(queue, message_id).await? else {
            tracing::warn!(queue, message_id, "DLQ message not found");
            return Ok(false);
        };
        if message.status.is_terminal() {
            return Ok(false);
        }

        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            handlers.get(queue).cloned()
        };
        let Some(handler) = handler else {
            tracing::error!(queue, "no handler registered");
            return Err(DlqError::NoHandler(queue.to_string()));
        };

        let now = self.clock.now_utc();
        let remaining = message.max_retries.saturating_sub(message.retry_count).max(1);
        let retry_config =
            policy_for_reason(message.reason).to_config::<BoxError>().max_attempts(remaining);

        message.status = MessageStatus::Processing;
        message.retry_count += 1;
        message.last_failure_time = now;

        let payload = match &self.config.transform {
            Some(transform) => transform(&message),
            None => message.original_message.clone(),
        };

        let started = std::time::Instant::now();
        let attempt = tokio::time::timeout(
            self.config.processing_timeout,
            self.executor.execute(|| handler.handle(&payload), &retry_config),
        )
        .await;

        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(ResilienceError::Inner(
                format!("processing timed out after {:?}", self.config.processing_timeout).into(),
            )),
        };

        match result {
            Ok(outcome) => {
                self.store.delete(queue, message_id).await?;
                if let Some(callback) = &self.config.success_callback {
                    callback(&message);
                }
                counter!("dlq_retries_total", "queue" => queue.to_string(), "status" => "success")
                    .increment(1);
                histogram!("dlq_processing_seconds", "queue" => queue.to_string())
                    .record(started.elapsed().as_secs_f64());
                self.update_size_gauge(queue).await;
                self.publish_event(&message, "retry_success").await;
                tracing::info!(
                    queue,
                    message_id,
                    attempts = outcome.attempts,
                    "DLQ message retried successfully"
                );
                Ok(true)
            }
            Err(err) => {
                counter!("dlq_retries_total", "queue" => queue.to_string(), "status" => "failure")
                    .increment(1);
                let attempts_made = match &err {
                    ResilienceError::RetryExhausted { attempts, .. } => *attempts,
                    ResilienceError::BudgetExhausted { attempts } => (*attempts).max(1),
                    _ => 1,
                };
                message.retry_count =
                    (message.retry_count - 1 + attempts_made).min(message.max_retries);
                self.handle_retry_failure(message, err.to_string()).await
            }
        }
    }

    async fn handle_retry_failure(
        &self,
        mut message: DlqMessage,
        error: String,
    ) -> Result<bool, DlqError> {
        let now = self.clock.now_utc();
        let queue = message.queue_name.clone();

        if message.retry_count >= message.max_retries {
            self.store.promote_poison(&mut message, now).await?;
            self.store.delete(&queue, &message.message_id).await?;
            if let Some(callback) = &self.config.failure_callback {
                callback(&message);
            }
            counter!("dlq_poison_total", "queue" => queue.clone()).increment(1);
            self.update_size_gauge(&queue).await;
            self.publish_event(&message, "poison").await;
            tracing::error!(
                queue,
                message_id = %message.message_id,
                retries = message.retry_count,
                "message moved to poison queue"
            );
        } else {
            message.next_retry_time =
                self.next_retry_time(message.reason, message.retry_count, now);
            message.record_error(error, now);
            message.status = MessageStatus::Retrying;
            self.store.put(&message).await?;
            tracing::warn!(
                queue,
                message_id = %message.message_id,
                retry_count = message.retry_count,
                max_retries = message.max_retries,
                next_retry = ?message.next_retry_time,
                "DLQ retry failed, rescheduled"
            );
        }
        Ok(false)
    }

    /// Start one polling loop per registered queue.
    pub async fn start(self: Arc<Self>) {
        let queues: Vec<String> = {
            let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            handlers.keys().cloned().collect()
        };
        let mut tasks = self.tasks.lock().await;
        for queue in queues {
            let handler = Arc::clone(&self);
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                tracing::info!(queue, "DLQ retry processor started");
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(handler.config.poll_interval) => {
                            handler.process_ready(&queue).await;
                        }
                    }
                }
                tracing::info!(queue, "DLQ retry processor stopped");
            }));
        }
    }

    /// Stop the polling loops and wait for them to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// One poll cycle: dispatch every due message concurrently, bounded by
    /// the batch size.
    pub async fn process_ready(&self, queue: &str) {
        let now = self.clock.now_utc();
        let ready = match self.store.list_ready(queue, now, self.config.batch_size).await {
            Ok(ready) => ready,
            Err(e) => {
                tracing::error!(queue, error = %e, "DLQ poll failed");
                return;
            }
        };

        let retries = ready.iter().map(|message| async move {
            if let Err(e) = self.retry(queue, &message.message_id).await {
                tracing::error!(queue, message_id = %message.message_id, error = %e, "DLQ retry errored");
            }
        });
        futures::future::join_all(retries).await;
    }

    /// Reset matching messages for immediate redelivery.
    pub async fn replay(
        &self,
        queue: &str,
        status: Option<MessageStatus>,
        limit: Option<usize>,
    ) -> Result<usize, DlqError> {
        let now = self.clock.now_utc();
        let messages = self.store.list_all(queue, limit.unwrap_or(1000)).await?;
        let mut replayed = 0;
        for mut message in messages {
            if status.is_some_and(|s| message.status != s) {
                continue;
            }
            message.status = MessageStatus::Pending;
            message.retry_count = 0;
            message.error_details.clear();
            message.next_retry_time = Some(now);
            self.store.put(&message).await?;
            replayed += 1;
        }
        tracing::info!(queue, replayed, "replayed DLQ messages");
        Ok(replayed)
    }

    /// Delete matching messages from the live queue.
    pub async fn purge(
        &self,
        queue: &str,
        status: Option<MessageStatus>,
        older_than: Option<Duration>,
    ) -> Result<usize, DlqError> {
        let cutoff = older_than
            .map(|age| self.clock.now_utc() - chrono::Duration::milliseconds(age.as_millis() as i64));
        let messages = self.store.list_all(queue, 10_000).await?;
        let mut purged = 0;
        for message in messages {
            if status.is_some_and(|s| message.status != s) {
                continue;
            }
            if cutoff.is_some_and(|cutoff| message.first_failure_time > cutoff) {
                continue;
            }
            self.store.delete(queue, &message.message_id).await?;
            purged += 1;
        }
        self.update_size_gauge(queue).await;
        tracing::info!(queue, purged, "purged DLQ messages");
        Ok(purged)
    }

    pub async fn stats(&self) -> Result<DlqStats, DlqError> {
        self.store.stats().await
    }

    /// Breaker and budget counters for this handler's retry path.
    pub fn resilience_metrics(&self) -> (CircuitBreakerMetrics, RetryBudgetSnapshot) {
        (self.breaker.metrics(), self.budget.snapshot())
    }

    fn next_retry_time(
        &self,
        reason: DlqReason,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if retry_count >= self.config.max_retries {
            return None;
        }
        let settings = policy_for_reason(reason).backoff_settings();
        let delay = BackoffCalculator::new().delay(retry_count + 1, &settings);
        Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64))
    }

    async fn publish_event(&self, message: &DlqMessage, event_type: &str) {
        let Some(bus) = &self.bus else { return };
        let topic = format!("dlq.{}.{event_type}", message.queue_name);
        let headers =
            HashMap::from([("message_id".to_string(), message.message_id.clone())]);
        let payload = json!({
            "message_id": message.message_id,
            "queue_name": message.queue_name,
            "reason": message.reason.as_str(),
            "retry_count": message.retry_count,
            "timestamp": self.clock.now_utc().to_rfc3339(),
            "event_type": event_type,
        });
        if let Err(e) = bus.publish(&topic, headers, payload).await {
            tracing::warn!(topic, error = %e, "DLQ event publish failed");
        }
    }

    async fn update_size_gauge(&self, queue: &str) {
        if let Ok(size) = self.store.queue_size(queue).await {
            gauge!("dlq_size", "queue" => queue.to_string()).set(size as f64);
        }
    }

    fn claim(&self, queue: &str, message_id: &str) -> Option<InFlightGuard<'_>> {
        let key = format!("{queue}/{message_id}");
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !in_flight.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard { set: &self.in_flight, key })
    }
}

/// Releases the per-message claim on drop, whatever path the retry took.
struct InFlightGuard<'a> {
    set: &'a StdMutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|p| p.into_inner()).remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::MemoryStore;
    use crate::time::{InstantSleeper, ManualWallClock};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingHandler {
        calls: AtomicU32,
        succeed_after: u32,
    }

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _payload: &Value) -> Result<(), BoxError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.succeed_after {
                Err("handler failure".into())
            } else {
                Ok(())
            }
        }
    }

    fn handler_with(
        succeed_after: u32,
        max_retries: u32,
    ) -> (Arc<DlqHandler>, Arc<MemoryBus>, ManualWallClock) {
        let clock = ManualWallClock::new();
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let handler = Arc::new(
            DlqHandler::new(store, DlqConfig::new("orders").max_retries(max_retries))
                .with_bus(bus.clone())
                .with_clock(Arc::new(clock.clone()))
                .with_executor(RetryExecutor::new().with_sleeper(InstantSleeper)),
        );
        handler.register_handler(
            "orders",
            Arc::new(FailingHandler { calls: AtomicU32::new(0), succeed_after }),
        );
        (handler, bus, clock)
    }

    #[tokio::test]
    async fn send_creates_pending_message_and_event() {
        let (handler, bus, _) = handler_with(0, 3);
        let id = handler
            .send_to_dlq(
                "orders",
                json!({"order": 1}),
                DlqReason::NetworkError,
                "connection refused",
                0,
                HashMap::new(),
            )
            .await
            .unwrap();

        let msg = handler.store().get("orders", &id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.next_retry_time.is_some());
        assert_eq!(bus.events_for("dlq.orders.message_added").await.len(), 1);
    }

    #[tokio::test]
    async fn successful_retry_removes_message_and_emits_event() {
        let (handler, bus, _) = handler_with(0, 3);
        let id = handler
            .send_to_dlq("orders", json!({}), DlqReason::NetworkError, "net", 0, HashMap::new())
            .await
            .unwrap();

        assert!(handler.retry("orders", &id).await.unwrap());
        assert!(handler.store().get("orders", &id).await.unwrap().is_none());
        assert_eq!(handler.store().queue_size("orders").await.unwrap(), 0);
        assert_eq!(bus.events_for("dlq.orders.retry_success").await.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_message_is_promoted_to_poison() {
        let (handler, bus, _) = handler_with(u32::MAX, 2);
        let id = handler
            .send_to_dlq("orders", json!({}), DlqReason::ValidationFailed, "bad", 0, HashMap::new())
            .await
            .unwrap();

        let mut promoted = false;
        for _ in 0..3 {
            handler.retry("orders", &id).await.unwrap();
            if handler.store().poison_count("orders").await.unwrap() == 1 {
                promoted = true;
                break;
            }
        }
        assert!(promoted, "message should reach the poison queue");
        assert!(handler.store().get("orders", &id).await.unwrap().is_none());
        assert_eq!(bus.events_for("dlq.orders.poison").await.len(), 1);

        let stats = handler.stats().await.unwrap();
        assert_eq!(stats.total_poison_messages, 1);
    }

    #[tokio::test]
    async fn retry_count_never_exceeds_max_retries() {
        let (handler, _, _) = handler_with(u32::MAX, 2);
        let id = handler
            .send_to_dlq("orders", json!({}), DlqReason::ExecutionFailed, "x", 0, HashMap::new())
            .await
            .unwrap();

        let mut last_count = 0;
        for _ in 0..4 {
            let _ = handler.retry("orders", &id).await.unwrap();
            if let Some(msg) = handler.store().get("orders", &id).await.unwrap() {
                assert!(msg.retry_count >= last_count, "retry_count must not decrease");
                assert!(msg.retry_count <= msg.max_retries);
                last_count = msg.retry_count;
            }
        }
    }

    #[tokio::test]
    async fn budget_cutoff_reschedules_with_history() {
        // A dry retry budget stops the in-place run after one attempt, so
        // the message is rescheduled instead of burning straight to poison.
        let clock = ManualWallClock::new();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let budget = Arc::new(RetryBudget::new(RetryBudgetConfig {
            budget_percent: 0.0,
            min_requests: 0,
            tokens_per_second: 0.0,
            ..Default::default()
        }));
        let handler = Arc::new(
            DlqHandler::new(store, DlqConfig::new("orders").max_retries(5))
                .with_clock(Arc::new(clock.clone()))
                .with_executor(
                    RetryExecutor::new().with_budget(budget).with_sleeper(InstantSleeper),
                ),
        );
        handler.register_handler(
            "orders",
            Arc::new(FailingHandler { calls: AtomicU32::new(0), succeed_after: u32::MAX }),
        );
        let id = handler
            .send_to_dlq("orders", json!({}), DlqReason::NetworkError, "net", 0, HashMap::new())
            .await
            .unwrap();

        assert!(!handler.retry("orders", &id).await.unwrap());
        let msg = handler.store().get("orders", &id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Retrying);
        assert_eq!(msg.retry_count, 1);
        assert!(msg.next_retry_time.is_some());
        assert!(!msg.error_history.is_empty());
    }

    #[tokio::test]
    async fn missing_handler_is_an_error() {
        let clock = ManualWallClock::new();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let handler = Arc::new(
            DlqHandler::new(store, DlqConfig::new("orders"))
                .with_clock(Arc::new(clock.clone())),
        );
        let id = handler
            .send_to_dlq("orders", json!({}), DlqReason::Unknown, "x", 0, HashMap::new())
            .await
            .unwrap();
        assert!(matches!(
            handler.retry("orders", &id).await,
            Err(DlqError::NoHandler(_))
        ));
    }

    #[tokio::test]
    async fn retry_of_missing_message_returns_false() {
        let (handler, _, _) = handler_with(0, 3);
        assert!(!handler.retry("orders", "nope").await.unwrap());
    }

    struct SlowHandler;

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, _payload: &Value) -> Result<(), BoxError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_retries_of_one_message_cannot_both_run() {
        let (handler, _, _) = handler_with(0, 3);
        handler.register_handler("orders", Arc::new(SlowHandler));
        let id = handler
            .send_to_dlq("orders", json!({}), DlqReason::NetworkError, "net", 0, HashMap::new())
            .await
            .unwrap();

        let (a, b) =
            tokio::join!(handler.retry("orders", &id), handler.retry("orders", &id));
        let successes = [a.unwrap(), b.unwrap()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1, "only one concurrent retry may win");
    }

    #[tokio::test]
    async fn replay_resets_counters_and_schedules_now() {
        let (handler, _, clock) = handler_with(u32::MAX, 5);
        let id = handler
            .send_to_dlq("orders", json!({}), DlqReason::NetworkError, "net", 0, HashMap::new())
            .await
            .unwrap();
        let _ = handler.retry("orders", &id).await.unwrap();

        let replayed =
            handler.replay("orders", Some(MessageStatus::Retrying), None).await.unwrap();
        assert_eq!(replayed, 1);

        let msg = handler.store().get("orders", &id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.next_retry_time, Some(clock.now_utc()));

        let ready =
            handler.store().list_ready("orders", clock.now_utc(), 10).await.unwrap();
        assert_eq!(ready.len(), 1);
    }

    #[tokio::test]
    async fn purge_filters_by_status_and_age() {
        let (handler, _, clock) = handler_with(u32::MAX, 5);
        handler
            .send_to_dlq("orders", json!({"n": 1}), DlqReason::NetworkError, "x", 0, HashMap::new())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(7200));
        handler
            .send_to_dlq("orders", json!({"n": 2}), DlqReason::NetworkError, "x", 0, HashMap::new())
            .await
            .unwrap();

        // Only the first message is older than an hour.
        let purged = handler
            .purge("orders", None, Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(handler.store().queue_size("orders").await.unwrap(), 1);

        let purged = handler.purge("orders", Some(MessageStatus::Failed), None).await.unwrap();
        assert_eq!(purged, 0, "status filter should exclude pending messages");
    }

    #[tokio::test]
    async fn background_processor_drains_due_messages() {
        let (handler, _, clock) = handler_with(0, 3);
        let id = handler
            .send_to_dlq("orders", json!({}), DlqReason::NetworkError, "net", 0, HashMap::new())
            .await
            .unwrap();

        // Make the message due, then run one poll cycle directly.
        clock.advance(Duration::from_secs(3600));
        handler.process_ready("orders").await;
        assert!(handler.store().get("orders", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_and_stop_manage_poller_tasks() {
        let (handler, _, _) = handler_with(0, 3);
        handler.clone().start().await;
        handler.stop().await;
        assert!(handler.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn reason_policy_map_matches_contract() {
        assert_eq!(policy_for_reason(DlqReason::NetworkError).name, "network");
        assert_eq!(policy_for_reason(DlqReason::Timeout).name, "network");
        assert_eq!(policy_for_reason(DlqReason::WebhookFailed).name, "webhook");
        assert_eq!(policy_for_reason(DlqReason::ExecutionFailed).name, "critical");
        assert_eq!(policy_for_reason(DlqReason::ValidationFailed).name, "validation");
        assert_eq!(policy_for_reason(DlqReason::AuthError).name, "auth");
        assert_eq!(policy_for_reason(DlqReason::Unknown).name, "standard");
    }
}
