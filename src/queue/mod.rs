//! In-process event queue subsystem.
//!
//! # Data Flow
//! ```text
//! Publisher (request handler, middleware, startup self-check)
//!     → Runtime::stream_message (stamp Message)
//!     → NamedQueue::append (bounded channel, waits at most append_timeout)
//!     → run loop (one task per queue, FIFO)
//!     → handlers registered for the topic, in registration order
//!         failure → logged, redelivered to that handler up to max_retries
//!         rejection → logged, never redelivered
//! ```
//!
//! # Design Decisions
//! - Register before run: the handler table is frozen when the loop starts
//! - A full buffer is an error returned to the publisher, never a silent drop
//! - Handlers for one topic run sequentially; a failing or panicking handler
//!   never stops the loop
//! - Delivery is at-least-once and in-process only. On shutdown the loop
//!   drains what is buffered until its drain deadline; anything left after
//!   that is lost and logged with a count

pub mod memory;
pub mod message;
pub mod named;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::{MemoryQueue, MemoryQueueBackend, MemoryQueueOptions};
pub use message::Message;
pub use named::NamedQueue;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A failure that a redelivery cannot fix, such as a payload of the wrong
/// shape. A handler returning it is not given the message again.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Rejected(#[source] pub HandlerError);

impl Rejected {
    pub fn new(err: impl Into<HandlerError>) -> Self {
        Self(err.into())
    }
}

/// Errors surfaced by queue operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The buffer stayed full for the whole append timeout.
    #[error("queue {queue:?} is saturated ({capacity} pending messages)")]
    Saturated { queue: String, capacity: usize },

    #[error("queue {queue:?} is closed")]
    Closed { queue: String },

    #[error("queue {queue:?}: handlers must be registered before the run loop starts (topic {topic:?})")]
    RegisterAfterRun { queue: String, topic: String },

    #[error("queue {queue:?} is already running")]
    AlreadyRunning { queue: String },
}

/// A handler invocation that did not succeed. Logged by the run loop.
#[derive(Debug, Error)]
#[error("handler #{index} for topic {topic:?} on queue {queue:?} {outcome}")]
pub struct HandlerExecutionError {
    pub queue: String,
    pub topic: String,
    pub index: usize,
    pub outcome: HandlerOutcome,
}

#[derive(Debug, Error)]
pub enum HandlerOutcome {
    #[error("failed: {0}")]
    Failed(HandlerError),
    #[error("rejected the message: {0}")]
    Rejected(HandlerError),
    #[error("panicked")]
    Panicked,
}

impl HandlerOutcome {
    /// Whether a redelivery may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerOutcome::Rejected(_))
    }
}

/// Consumer of messages for one topic.
///
/// Delivery is at-least-once: a handler may see the same message again after
/// it failed, so handlers must tolerate duplicates.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Arc<Message>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Arc<Message>) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Queue capability contract.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Backend identifier.
    fn kind(&self) -> &str;

    /// Queue name (empty for the default queue).
    fn name(&self) -> &str;

    /// Subscribe `handler` to `topic`. Must be called before [`Queue::run`].
    fn register(&self, topic: &str, handler: Arc<dyn Handler>) -> Result<(), QueueError>;

    /// Enqueue a message for asynchronous dispatch.
    async fn append(&self, message: Message) -> Result<(), QueueError>;

    /// Dispatch loop. Returns once `shutdown` fires or [`Queue::close`] is
    /// called, after draining buffered messages.
    async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<(), QueueError>;

    /// Dispatch everything currently buffered, then return the number of
    /// messages processed. Fails if the run loop owns the queue.
    async fn run_once(&self) -> Result<usize, QueueError>;

    /// Stop accepting messages and let the run loop drain and exit.
    fn close(&self);

    fn is_running(&self) -> bool;
}
