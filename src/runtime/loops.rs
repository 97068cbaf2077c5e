//! Run loops of the named queues.
//!
//! Once started, every queue the runtime creates gets its own loop on the
//! queue shutdown signal, so a queue created while serving is never left
//! without a consumer. Stopping fires that signal and waits for each loop to
//! drain.

use tokio::task::JoinHandle;

use crate::lifecycle::Shutdown;
use crate::queue::{NamedQueue, QueueError};

pub(super) type QueueTask = (NamedQueue, JoinHandle<Result<(), QueueError>>);

pub(super) enum QueueLoops {
    /// Queues are created but nothing runs them yet.
    Idle,
    Running {
        shutdown: Shutdown,
        tasks: Vec<QueueTask>,
    },
    /// Loops were told to stop; new queues are refused.
    Stopped,
}

impl QueueLoops {
    pub fn start(&mut self) -> bool {
        if !matches!(self, QueueLoops::Idle) {
            return false;
        }
        *self = QueueLoops::Running {
            shutdown: Shutdown::new(),
            tasks: Vec::new(),
        };
        true
    }

    /// Spawn the loop for `queue` unless one is tracked already.
    pub fn spawn(&mut self, queue: &NamedQueue) {
        let QueueLoops::Running { shutdown, tasks } = self else {
            return;
        };
        if tasks.iter().any(|(running, _)| running.name() == queue.name()) {
            return;
        }
        tracing::info!(queue = %queue.name(), kind = queue.backend().kind(), "Queue run loop starting");
        let looped = queue.clone();
        let rx = shutdown.subscribe();
        tasks.push((queue.clone(), tokio::spawn(async move { looped.run(rx).await })));
    }

    /// True once every tracked loop runs or has already exited.
    pub fn all_started(&self) -> bool {
        match self {
            QueueLoops::Running { tasks, .. } => tasks
                .iter()
                .all(|(queue, task)| queue.is_running() || task.is_finished()),
            _ => true,
        }
    }

    /// Fire the queue shutdown signal and hand back the loops to await.
    pub fn stop(&mut self) -> Vec<QueueTask> {
        match std::mem::replace(self, QueueLoops::Stopped) {
            QueueLoops::Running { shutdown, tasks } => {
                shutdown.trigger();
                tasks
            }
            _ => Vec::new(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, QueueLoops::Stopped)
    }
}

/// Wait for stopped loops, logging how each one ended.
pub(super) async fn join(tasks: Vec<QueueTask>) -> usize {
    let count = tasks.len();
    for (queue, task) in tasks {
        let name = queue.name();
        match task.await {
            Ok(Ok(())) => tracing::debug!(queue = %name, "Queue stopped"),
            Ok(Err(e)) => tracing::warn!(queue = %name, error = %e, "Queue stopped with error"),
            Err(e) => tracing::error!(queue = %name, error = %e, "Queue task failed"),
        }
    }
    count
}
