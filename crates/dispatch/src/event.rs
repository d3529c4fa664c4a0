use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_store::EventEnvelope;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::HandlerError;
use crate::retry::RetryPolicy;

/// Reacts to recorded events. One handler owns each event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}

/// An event whose handler exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: EventEnvelope,
    pub handler: String,
    pub error: String,
    /// Total handler invocations, including the first attempt.
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Shared in-memory queue of events that could not be handled.
#[derive(Clone, Default)]
pub struct DeadLetterQueue {
    entries: Arc<RwLock<Vec<DeadLetter>>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, entry: DeadLetter) {
        tracing::error!(
            event_type = %entry.event.event_type,
            handler = %entry.handler,
            attempts = entry.attempts,
            error = %entry.error,
            "event dead-lettered"
        );
        metrics::counter!("events_dead_lettered").increment(1);
        self.entries.write().await.push(entry);
    }

    /// Snapshot of the current entries.
    pub async fn entries(&self) -> Vec<DeadLetter> {
        self.entries.read().await.clone()
    }

    /// Removes and returns all entries, e.g. for redelivery.
    pub async fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.entries.write().await)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Publishes recorded events into the dispatcher's intake.
///
/// Cheap to clone; the write side holds one so every append is
/// announced without the store knowing about handlers.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl EventSink {
    pub fn publish(&self, event: EventEnvelope) {
        // Send only fails after shutdown; late events are dropped.
        let _ = self.tx.send(event);
    }

    pub fn publish_all(&self, events: &[EventEnvelope]) {
        for event in events {
            self.publish(event.clone());
        }
    }
}

struct HandlerSlot {
    name: String,
    enabled: bool,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

/// Routes recorded events to the handler registered for their type.
///
/// Each registration gets a dedicated worker task fed by an in-order
/// channel, so one slow handler never blocks another and a single
/// handler always sees its events in publish order. Registering a
/// second handler for the same type replaces the first.
pub struct EventDispatcher {
    slots: Arc<RwLock<HashMap<String, HandlerSlot>>>,
    dead_letters: DeadLetterQueue,
    intake: mpsc::UnboundedSender<EventEnvelope>,
    stop: watch::Sender<bool>,
    router: std::sync::Mutex<Option<JoinHandle<()>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

async fn route(slots: &RwLock<HashMap<String, HandlerSlot>>, event: EventEnvelope) {
    let slots = slots.read().await;
    match slots.get(&event.event_type) {
        Some(slot) if slot.enabled => {
            let _ = slot.tx.send(event);
        }
        Some(slot) => {
            tracing::debug!(
                event_type = %event.event_type,
                handler = %slot.name,
                "handler disabled, event skipped"
            );
        }
        None => {
            tracing::debug!(
                event_type = %event.event_type,
                "no handler registered, event skipped"
            );
        }
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (intake, mut intake_rx) = mpsc::unbounded_channel::<EventEnvelope>();
        let (stop, mut stop_rx) = watch::channel(false);
        let slots: Arc<RwLock<HashMap<String, HandlerSlot>>> = Arc::new(RwLock::new(HashMap::new()));

        let router_slots = Arc::clone(&slots);
        let router = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    received = intake_rx.recv() => {
                        let Some(event) = received else { break };
                        route(&router_slots, event).await;
                    }
                    _ = stop_rx.changed() => {
                        // Drain what was published before the stop
                        // signal, then exit.
                        while let Ok(event) = intake_rx.try_recv() {
                            route(&router_slots, event).await;
                        }
                        break;
                    }
                }
            }
        });

        Self {
            slots,
            dead_letters: DeadLetterQueue::new(),
            intake,
            stop,
            router: std::sync::Mutex::new(Some(router)),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A sink for publishing events into this dispatcher.
    pub fn sink(&self) -> EventSink {
        EventSink {
            tx: self.intake.clone(),
        }
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Registers `handler` for `event_type` with the default retry
    /// policy and dead-lettering enabled.
    pub async fn register(
        &self,
        event_type: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        self.register_with(event_type, name, handler, RetryPolicy::default(), true)
            .await;
    }

    /// Registers `handler` for `event_type`, replacing any existing
    /// registration for that type. When `dead_letter` is false,
    /// exhausted events are dropped with a warning instead of queued.
    pub async fn register_with(
        &self,
        event_type: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        retry: RetryPolicy,
        dead_letter: bool,
    ) {
        let event_type = event_type.into();
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel::<EventEnvelope>();

        let worker = tokio::spawn(run_worker(
            name.clone(),
            handler,
            rx,
            retry,
            dead_letter.then(|| self.dead_letters.clone()),
        ));
        self.workers.lock().unwrap().push(worker);

        let mut slots = self.slots.write().await;
        if let Some(previous) = slots.insert(
            event_type.clone(),
            HandlerSlot {
                name: name.clone(),
                enabled: true,
                tx,
            },
        ) {
            // Dropping the old sender lets the previous worker drain
            // its queue and exit.
            tracing::info!(
                event_type = %event_type,
                previous = %previous.name,
                replacement = %name,
                "event handler replaced"
            );
        }
    }

    /// Toggles the handler for `event_type`. Returns false when no
    /// handler is registered.
    pub async fn set_enabled(&self, event_type: &str, enabled: bool) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get_mut(event_type) {
            Some(slot) => {
                slot.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Stops the router, closes every worker queue, and waits for
    /// in-flight deliveries to finish. Events published before the
    /// call are still delivered.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let router = self.router.lock().unwrap().take();
        if let Some(router) = router {
            let _ = router.await;
        }
        // Dropping the slot senders lets each worker drain its queue
        // and exit.
        self.slots.write().await.clear();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(
    name: String,
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::UnboundedReceiver<EventEnvelope>,
    retry: RetryPolicy,
    dead_letters: Option<DeadLetterQueue>,
) {
    while let Some(event) = rx.recv().await {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match handler.handle(&event).await {
                Ok(()) => {
                    metrics::counter!("events_dispatched").increment(1);
                    if attempt > 1 {
                        tracing::info!(
                            handler = %name,
                            event_type = %event.event_type,
                            attempt,
                            "handler recovered after retry"
                        );
                    }
                    break;
                }
                Err(err) if attempt > retry.max_retries => {
                    match &dead_letters {
                        Some(queue) => {
                            queue
                                .push(DeadLetter {
                                    event: event.clone(),
                                    handler: name.clone(),
                                    error: err.to_string(),
                                    attempts: attempt,
                                    failed_at: Utc::now(),
                                })
                                .await;
                        }
                        None => {
                            metrics::counter!("events_dropped").increment(1);
                            tracing::warn!(
                                handler = %name,
                                event_type = %event.event_type,
                                attempts = attempt,
                                error = %err,
                                "retries exhausted, event dropped"
                            );
                        }
                    }
                    break;
                }
                Err(err) => {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        handler = %name,
                        event_type = %event.event_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "handler failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use event_store::{AggregateId, NewEvent, Sequence, Version};
    use tokio::sync::Mutex as AsyncMutex;

    fn make_event(event_type: &str, version: i64, sequence: u64) -> EventEnvelope {
        EventEnvelope::record(
            NewEvent::new(event_type, serde_json::json!({"n": version})),
            AggregateId::new(),
            "User",
            Version::new(version),
            Sequence::new(sequence),
        )
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl CountingHandler {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first,
            })
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &EventEnvelope) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(HandlerError::failed("transient"))
            } else {
                Ok(())
            }
        }
    }

    struct RecordingHandler {
        seen: AsyncMutex<Vec<u64>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
            self.seen.lock().await.push(event.sequence.as_u64());
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let dispatcher = EventDispatcher::new();
        let handler = CountingHandler::new(0);
        dispatcher
            .register("UserCreated", "audit", Arc::clone(&handler) as Arc<dyn EventHandler>)
            .await;

        dispatcher.sink().publish(make_event("UserCreated", 1, 1));
        dispatcher.sink().publish(make_event("OrderPlaced", 1, 2));
        dispatcher.shutdown().await;

        // The OrderPlaced event has no handler and is skipped.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let dispatcher = EventDispatcher::new();
        let handler = CountingHandler::new(2);
        dispatcher
            .register_with(
                "UserCreated",
                "flaky",
                Arc::clone(&handler) as Arc<dyn EventHandler>,
                RetryPolicy::exponential(3, Duration::from_millis(10)),
                true,
            )
            .await;

        dispatcher.sink().publish(make_event("UserCreated", 1, 1));
        dispatcher.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(dispatcher.dead_letters().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_dead_letter_once() {
        let dispatcher = EventDispatcher::new();
        let handler = CountingHandler::new(u32::MAX);
        dispatcher
            .register_with(
                "UserCreated",
                "broken",
                Arc::clone(&handler) as Arc<dyn EventHandler>,
                RetryPolicy::fixed(2, Duration::from_millis(5)),
                true,
            )
            .await;

        dispatcher.sink().publish(make_event("UserCreated", 1, 1));
        dispatcher.shutdown().await;

        // max_retries = 2 means exactly three invocations.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let letters = dispatcher.dead_letters().entries().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].handler, "broken");
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].event.event_type, "UserCreated");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_without_dead_letter_drop() {
        let dispatcher = EventDispatcher::new();
        let handler = CountingHandler::new(u32::MAX);
        dispatcher
            .register_with(
                "UserCreated",
                "broken",
                Arc::clone(&handler) as Arc<dyn EventHandler>,
                RetryPolicy::none(),
                false,
            )
            .await;

        dispatcher.sink().publish(make_event("UserCreated", 1, 1));
        dispatcher.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(dispatcher.dead_letters().is_empty().await);
    }

    #[tokio::test]
    async fn handler_sees_events_in_publish_order() {
        let dispatcher = EventDispatcher::new();
        let handler = Arc::new(RecordingHandler {
            seen: AsyncMutex::new(Vec::new()),
        });
        dispatcher
            .register("UserCreated", "recorder", Arc::clone(&handler) as Arc<dyn EventHandler>)
            .await;

        for sequence in 1..=20 {
            dispatcher
                .sink()
                .publish(make_event("UserCreated", sequence as i64, sequence));
        }
        dispatcher.shutdown().await;

        let seen = handler.seen.lock().await;
        assert_eq!(*seen, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn replacement_registration_wins() {
        let dispatcher = EventDispatcher::new();
        let first = CountingHandler::new(0);
        let second = CountingHandler::new(0);
        dispatcher
            .register("UserCreated", "first", Arc::clone(&first) as Arc<dyn EventHandler>)
            .await;
        dispatcher
            .register("UserCreated", "second", Arc::clone(&second) as Arc<dyn EventHandler>)
            .await;
        assert_eq!(dispatcher.handler_count().await, 1);

        dispatcher.sink().publish(make_event("UserCreated", 1, 1));
        dispatcher.shutdown().await;

        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_handler_skips_events() {
        let dispatcher = EventDispatcher::new();
        let handler = CountingHandler::new(0);
        dispatcher
            .register("UserCreated", "audit", Arc::clone(&handler) as Arc<dyn EventHandler>)
            .await;
        assert!(dispatcher.set_enabled("UserCreated", false).await);
        assert!(!dispatcher.set_enabled("Unknown", false).await);

        dispatcher.sink().publish(make_event("UserCreated", 1, 1));
        dispatcher.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drain_empties_dead_letter_queue() {
        let queue = DeadLetterQueue::new();
        queue
            .push(DeadLetter {
                event: make_event("UserCreated", 1, 1),
                handler: "audit".into(),
                error: "boom".into(),
                attempts: 4,
                failed_at: Utc::now(),
            })
            .await;
        assert_eq!(queue.len().await, 1);

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty().await);
    }
}
