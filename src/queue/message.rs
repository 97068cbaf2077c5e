//! Queue messages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Rejected;

/// An immutable message addressed to a topic of a named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    queue: String,
    topic: String,
    payload: Value,
    produced_at: DateTime<Utc>,
}

impl Message {
    /// Stamp a new message with a fresh id and the current time.
    pub fn new(queue: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            topic: topic.into(),
            payload,
            produced_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the queue the message was built for (empty = default queue).
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    /// Deserialize the payload into a typed record. A payload of the wrong
    /// shape is [`Rejected`]; retrying it would fail the same way.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Rejected> {
        T::deserialize(&self.payload).map_err(Rejected::new)
    }
}

/// A message in flight inside a queue, with its redelivery state.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub message: Arc<Message>,
    /// Handler positions still owed this message; `None` means all of them.
    pub targets: Option<Vec<usize>>,
    pub attempt: u32,
}

impl Delivery {
    pub fn new(message: Message) -> Self {
        Self {
            message: Arc::new(message),
            targets: None,
            attempt: 0,
        }
    }

    pub fn wants(&self, index: usize) -> bool {
        self.targets.as_ref().map_or(true, |t| t.contains(&index))
    }

    pub fn retry(&self, failed: Vec<usize>) -> Self {
        Self {
            message: self.message.clone(),
            targets: Some(failed),
            attempt: self.attempt + 1,
        }
    }
}
