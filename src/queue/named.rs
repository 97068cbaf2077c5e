//! Named queue handles handed out by the runtime.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::queue::{Handler, Message, Queue, QueueError};

/// One event-queue instance, addressed by name. The empty name is the
/// default queue.
///
/// Handlers must be registered before [`NamedQueue::run`] starts; the run
/// loop freezes the handler table.
#[derive(Clone)]
pub struct NamedQueue {
    name: String,
    backend: Arc<dyn Queue>,
}

impl NamedQueue {
    pub fn new(name: impl Into<String>, backend: Arc<dyn Queue>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn Queue> {
        &self.backend
    }

    /// Subscribe a handler to `topic`. Handlers of one topic run in
    /// registration order.
    pub fn register(&self, topic: &str, handler: impl Handler) -> Result<(), QueueError> {
        self.backend.register(topic, Arc::new(handler))
    }

    pub async fn append(&self, message: Message) -> Result<(), QueueError> {
        self.backend.append(message).await
    }

    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<(), QueueError> {
        self.backend.run(shutdown).await
    }

    pub async fn run_once(&self) -> Result<usize, QueueError> {
        self.backend.run_once().await
    }

    pub fn close(&self) {
        self.backend.close();
    }

    pub fn is_running(&self) -> bool {
        self.backend.is_running()
    }
}

impl fmt::Debug for NamedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedQueue")
            .field("name", &self.name)
            .field("kind", &self.backend.kind())
            .field("running", &self.backend.is_running())
            .finish()
    }
}
