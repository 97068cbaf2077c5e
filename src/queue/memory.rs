//! In-memory queue backend: a bounded channel plus a single dispatch loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time;

use crate::adapters::{parse_options, AdapterError, Backend, Capability};
use crate::observability::metrics;
use crate::queue::message::Delivery;
use crate::queue::{
    Handler, HandlerExecutionError, HandlerOutcome, Message, Queue, QueueError, Rejected,
};

type HandlerTable = HashMap<String, Vec<Arc<dyn Handler>>>;

/// Options for the `memory` queue backend.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryQueueOptions {
    /// Capacity of the pending-message buffer.
    pub buffer: usize,

    /// How long `append` waits for room before reporting saturation.
    pub append_timeout_ms: u64,

    /// Redeliveries of a message to a handler that failed on it.
    pub max_retries: u32,

    /// How long the loop keeps dispatching buffered messages after shutdown.
    pub drain_timeout_ms: u64,
}

impl Default for MemoryQueueOptions {
    fn default() -> Self {
        Self {
            buffer: 10_000,
            append_timeout_ms: 100,
            max_retries: 3,
            drain_timeout_ms: 2_000,
        }
    }
}

/// Lifecycle of the dispatch loop.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl From<u8> for QueueState {
    fn from(val: u8) -> Self {
        match val {
            1 => QueueState::Running,
            2 => QueueState::Stopped,
            _ => QueueState::Idle,
        }
    }
}

/// In-process queue. FIFO, one dispatch loop, handlers run sequentially.
pub struct MemoryQueue {
    name: String,
    options: MemoryQueueOptions,
    handlers: RwLock<HandlerTable>,
    tx: mpsc::Sender<Delivery>,
    rx: Mutex<mpsc::Receiver<Delivery>>,
    state: AtomicU8,
    closed: AtomicBool,
    close_signal: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, options: MemoryQueueOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.buffer.max(1));
        Self {
            name: name.into(),
            options,
            handlers: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(rx),
            state: AtomicU8::new(QueueState::Idle as u8),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    pub fn state(&self) -> QueueState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn options(&self) -> &MemoryQueueOptions {
        &self.options
    }

    fn label(&self) -> &str {
        if self.name.is_empty() {
            "default"
        } else {
            &self.name
        }
    }

    fn snapshot(&self) -> HandlerTable {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn closed_error(&self) -> QueueError {
        QueueError::Closed { queue: self.name.clone() }
    }

    async fn dispatch(&self, table: &HandlerTable, delivery: Delivery) {
        let message = delivery.message.clone();
        let topic = message.topic();

        let Some(handlers) = table.get(topic) else {
            tracing::warn!(
                queue = %self.label(),
                topic,
                message_id = %message.id(),
                "No handlers registered for topic, message discarded"
            );
            metrics::record_queue_dropped(self.label(), "unrouted", 1);
            return;
        };

        let mut failed = Vec::new();
        for (index, handler) in handlers.iter().enumerate() {
            if !delivery.wants(index) {
                continue;
            }

            let started = Instant::now();
            let handler = handler.clone();
            let msg = message.clone();
            // Spawned so a panicking handler is caught as a JoinError.
            let outcome = match tokio::spawn(async move { handler.handle(msg).await }).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) if e.is::<Rejected>() => Some(HandlerOutcome::Rejected(e)),
                Ok(Err(e)) => Some(HandlerOutcome::Failed(e)),
                Err(e) if e.is_panic() => Some(HandlerOutcome::Panicked),
                Err(e) => Some(HandlerOutcome::Failed(e.into())),
            };
            metrics::record_queue_dispatch(self.label(), topic, outcome.is_none(), started);

            if let Some(outcome) = outcome {
                let retryable = outcome.is_retryable();
                let err = HandlerExecutionError {
                    queue: self.name.clone(),
                    topic: topic.to_string(),
                    index,
                    outcome,
                };
                tracing::error!(
                    message_id = %message.id(),
                    attempt = delivery.attempt,
                    error = %err,
                    "Handler failed"
                );
                if retryable {
                    failed.push(index);
                } else {
                    metrics::record_queue_dropped(self.label(), "rejected", 1);
                }
            }
        }

        if failed.is_empty() {
            return;
        }
        if delivery.attempt >= self.options.max_retries {
            tracing::error!(
                queue = %self.label(),
                topic,
                message_id = %message.id(),
                attempts = delivery.attempt + 1,
                "Giving up on message after repeated handler failures"
            );
            metrics::record_queue_dropped(self.label(), "retries_exhausted", 1);
            return;
        }
        if let Err(e) = self.tx.try_send(delivery.retry(failed)) {
            let reason = match e {
                TrySendError::Full(_) => "saturated",
                TrySendError::Closed(_) => "closed",
            };
            tracing::error!(
                queue = %self.label(),
                topic,
                message_id = %message.id(),
                reason,
                "Redelivery dropped"
            );
            metrics::record_queue_dropped(self.label(), "redelivery", 1);
        }
    }

    /// Dispatch what is left in the buffer until the drain deadline.
    async fn drain(&self, table: &HandlerTable, rx: &mut mpsc::Receiver<Delivery>) {
        let deadline = time::Instant::now() + Duration::from_millis(self.options.drain_timeout_ms);
        let mut drained = 0usize;

        loop {
            if time::Instant::now() >= deadline {
                let mut lost = 0usize;
                while rx.try_recv().is_ok() {
                    lost += 1;
                }
                if lost > 0 {
                    tracing::warn!(queue = %self.label(), lost, "Drain deadline expired, pending messages dropped");
                    metrics::record_queue_dropped(self.label(), "drain_deadline", lost as u64);
                }
                break;
            }
            match time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(delivery)) => {
                    self.dispatch(table, delivery).await;
                    drained += 1;
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        if drained > 0 {
            tracing::info!(queue = %self.label(), drained, "Drained pending messages");
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn kind(&self) -> &str {
        "memory"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, topic: &str, handler: Arc<dyn Handler>) -> Result<(), QueueError> {
        if self.state() != QueueState::Idle {
            return Err(QueueError::RegisterAfterRun {
                queue: self.name.clone(),
                topic: topic.to_string(),
            });
        }
        let mut table = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        table.entry(topic.to_string()).or_default().push(handler);
        tracing::debug!(queue = %self.label(), topic, handlers = table[topic].len(), "Handler registered");
        Ok(())
    }

    async fn append(&self, message: Message) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        let delivery = Delivery::new(message);

        let result = match self.tx.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(delivery)) => {
                let wait = Duration::from_millis(self.options.append_timeout_ms);
                match time::timeout(wait, self.tx.send(delivery)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(self.closed_error()),
                    Err(_) => Err(QueueError::Saturated {
                        queue: self.name.clone(),
                        capacity: self.options.buffer,
                    }),
                }
            }
            Err(TrySendError::Closed(_)) => Err(self.closed_error()),
        };

        match &result {
            Ok(()) => metrics::record_queue_appended(self.label()),
            Err(QueueError::Saturated { capacity, .. }) => {
                tracing::warn!(queue = %self.label(), capacity, "Queue saturated, append rejected");
                metrics::record_queue_saturated(self.label());
            }
            Err(_) => {}
        }
        result
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), QueueError> {
        let mut rx = self
            .rx
            .try_lock()
            .map_err(|_| QueueError::AlreadyRunning { queue: self.name.clone() })?;

        self.state.store(QueueState::Running as u8, Ordering::Release);
        let table = self.snapshot();
        tracing::info!(queue = %self.label(), topics = table.len(), "Queue run loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!(queue = %self.label(), "Queue received shutdown signal");
                    break;
                }
                _ = self.close_signal.notified() => break,
                next = rx.recv() => match next {
                    Some(delivery) => self.dispatch(&table, delivery).await,
                    None => break,
                },
            }
        }

        self.closed.store(true, Ordering::Release);
        rx.close();
        self.drain(&table, &mut rx).await;

        self.state.store(QueueState::Stopped as u8, Ordering::Release);
        tracing::info!(queue = %self.label(), "Queue run loop stopped");
        Ok(())
    }

    async fn run_once(&self) -> Result<usize, QueueError> {
        let mut rx = self
            .rx
            .try_lock()
            .map_err(|_| QueueError::AlreadyRunning { queue: self.name.clone() })?;
        let table = self.snapshot();

        // Redeliveries queued during this pass are processed too.
        let mut processed = 0;
        while let Ok(delivery) = rx.try_recv() {
            self.dispatch(&table, delivery).await;
            processed += 1;
        }
        Ok(processed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_signal.notify_one();
    }

    fn is_running(&self) -> bool {
        self.state() == QueueState::Running
    }
}

/// Factory entry for `type = "memory"` queues.
pub struct MemoryQueueBackend;

#[async_trait]
impl Backend<dyn Queue> for MemoryQueueBackend {
    async fn connect(&self, name: &str, options: &Map<String, Value>) -> Result<Arc<dyn Queue>, AdapterError> {
        let options: MemoryQueueOptions = parse_options(Capability::Queue, "memory", options)?;
        if options.buffer == 0 {
            return Err(AdapterError::InvalidOptions {
                capability: Capability::Queue,
                kind: "memory".into(),
                source: serde::de::Error::custom("buffer must be greater than 0"),
            });
        }
        Ok(Arc::new(MemoryQueue::new(name, options)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::HandlerError;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    fn options(max_retries: u32) -> MemoryQueueOptions {
        MemoryQueueOptions {
            buffer: 16,
            append_timeout_ms: 10,
            max_retries,
            drain_timeout_ms: 500,
        }
    }

    type Log = Arc<StdMutex<Vec<String>>>;

    fn recorder(log: &Log, label: &'static str, fail: bool) -> Arc<dyn Handler> {
        let log = log.clone();
        Arc::new(move |message: Arc<Message>| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{label}:{}", message.payload()));
                if fail {
                    Err::<(), HandlerError>(format!("{label} failed").into())
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test]
    async fn test_registration_order_and_failure_isolation() {
        let queue = MemoryQueue::new("", options(0));
        let log: Log = Default::default();
        queue.register("t", recorder(&log, "h1", true)).unwrap();
        queue.register("t", recorder(&log, "h2", false)).unwrap();

        queue.append(Message::new("", "t", json!(1))).await.unwrap();
        queue.append(Message::new("", "t", json!(2))).await.unwrap();
        assert_eq!(queue.run_once().await.unwrap(), 2);

        assert_eq!(*log.lock().unwrap(), vec!["h1:1", "h2:1", "h1:2", "h2:2"]);
    }

    #[tokio::test]
    async fn test_fifo_through_run_loop() {
        let queue = Arc::new(MemoryQueue::new("audit", options(0)));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        queue
            .register(
                "t",
                Arc::new(move |message: Arc<Message>| {
                    let seen_tx = seen_tx.clone();
                    async move {
                        let _ = seen_tx.send(message.payload().clone());
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = queue.clone();
        let task = tokio::spawn(async move { runner.run(shutdown_rx).await });

        for i in 0..5 {
            queue.append(Message::new("audit", "t", json!(i))).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(seen_rx.recv().await.unwrap(), json!(i));
        }

        shutdown_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(queue.state(), QueueState::Stopped);
    }

    #[tokio::test]
    async fn test_saturation_is_reported() {
        let queue = MemoryQueue::new("", MemoryQueueOptions { buffer: 1, ..options(0) });
        queue.append(Message::new("", "t", json!(1))).await.unwrap();

        let started = Instant::now();
        let err = queue.append(Message::new("", "t", json!(2))).await.unwrap_err();
        assert_eq!(err, QueueError::Saturated { queue: "".into(), capacity: 1 });
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_register_after_run_is_rejected() {
        let queue = Arc::new(MemoryQueue::new("", options(0)));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = queue.clone();
        let task = tokio::spawn(async move { runner.run(shutdown_rx).await });

        while !queue.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let log: Log = Default::default();
        assert!(matches!(
            queue.register("late", recorder(&log, "h", false)),
            Err(QueueError::RegisterAfterRun { .. })
        ));

        let (_unused_tx, second_rx) = broadcast::channel(1);
        assert!(matches!(queue.run(second_rx).await, Err(QueueError::AlreadyRunning { .. })));
        assert!(matches!(queue.run_once().await, Err(QueueError::AlreadyRunning { .. })));

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_handler_is_redelivered_alone() {
        let queue = MemoryQueue::new("", options(3));
        let flaky_calls = Arc::new(AtomicU32::new(0));
        let steady_calls = Arc::new(AtomicU32::new(0));

        let calls = flaky_calls.clone();
        queue
            .register(
                "t",
                Arc::new(move |_: Arc<Message>| {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err::<(), HandlerError>("transient".into())
                        } else {
                            Ok(())
                        }
                    }
                }),
            )
            .unwrap();
        let calls = steady_calls.clone();
        queue
            .register(
                "t",
                Arc::new(move |_: Arc<Message>| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        queue.append(Message::new("", "t", json!(null))).await.unwrap();
        assert_eq!(queue.run_once().await.unwrap(), 2);
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
        assert_eq!(steady_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let queue = MemoryQueue::new("", options(2));
        let log: Log = Default::default();
        queue.register("t", recorder(&log, "bad", true)).unwrap();

        queue.append(Message::new("", "t", json!("x"))).await.unwrap();
        assert_eq!(queue.run_once().await.unwrap(), 3);
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rejected_message_is_not_redelivered() {
        let queue = MemoryQueue::new("", options(3));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        queue
            .register(
                "t",
                Arc::new(move |message: Arc<Message>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let _: Vec<u8> = message.decode()?;
                        Ok::<(), HandlerError>(())
                    }
                }),
            )
            .unwrap();

        queue.append(Message::new("", "t", json!({"not": "bytes"}))).await.unwrap();
        assert_eq!(queue.run_once().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_dispatch() {
        let queue = MemoryQueue::new("", options(0));
        let log: Log = Default::default();
        queue
            .register(
                "t",
                Arc::new(|_: Arc<Message>| async move {
                    if true {
                        panic!("handler bug");
                    }
                    Ok::<(), HandlerError>(())
                }),
            )
            .unwrap();
        queue.register("t", recorder(&log, "after", false)).unwrap();

        queue.append(Message::new("", "t", json!(1))).await.unwrap();
        queue.append(Message::new("", "t", json!(2))).await.unwrap();
        assert_eq!(queue.run_once().await.unwrap(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["after:1", "after:2"]);
    }

    #[tokio::test]
    async fn test_unrouted_message_is_discarded() {
        let queue = MemoryQueue::new("", options(0));
        queue.append(Message::new("", "nobody", json!(1))).await.unwrap();
        assert_eq!(queue.run_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_buffer_then_closes() {
        let queue = MemoryQueue::new("", options(0));
        let log: Log = Default::default();
        queue.register("t", recorder(&log, "h", false)).unwrap();
        for i in 0..3 {
            queue.append(Message::new("", "t", json!(i))).await.unwrap();
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        shutdown_tx.send(()).unwrap();
        queue.run(shutdown_rx).await.unwrap();

        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(
            queue.append(Message::new("", "t", json!(9))).await,
            Err(QueueError::Closed { queue: "".into() })
        );
    }

    #[tokio::test]
    async fn test_drain_deadline_drops_remaining() {
        let queue = MemoryQueue::new("", MemoryQueueOptions { drain_timeout_ms: 20, ..options(0) });
        let handled = Arc::new(AtomicU32::new(0));
        let counter = handled.clone();
        queue
            .register(
                "t",
                Arc::new(move |_: Arc<Message>| {
                    let counter = counter.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();
        for i in 0..3 {
            queue.append(Message::new("", "t", json!(i))).await.unwrap();
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        shutdown_tx.send(()).unwrap();
        queue.run(shutdown_rx).await.unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_stops_loop() {
        let queue = Arc::new(MemoryQueue::new("", options(0)));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = queue.clone();
        let task = tokio::spawn(async move { runner.run(shutdown_rx).await });

        queue.close();
        task.await.unwrap().unwrap();
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_backend_options() {
        let mut raw = Map::new();
        raw.insert("buffer".into(), json!(4));
        raw.insert("max_retries".into(), json!(1));
        let queue = MemoryQueueBackend.connect("jobs", &raw).await.unwrap();
        assert_eq!(queue.name(), "jobs");
        assert_eq!(queue.kind(), "memory");

        raw.insert("buffer".into(), json!(0));
        assert!(MemoryQueueBackend.connect("jobs", &raw).await.is_err());
    }
}
