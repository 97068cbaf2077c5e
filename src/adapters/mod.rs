//! Pluggable adapters for the cache, queue and locker capabilities.
//!
//! # Data Flow
//! ```text
//! AdapterConfig { type, options }
//!     → factory.rs (look up backend by `type` for the capability)
//!     → Backend::connect (parse options, open connections)
//!     → Arc<dyn Cache | Queue | Locker>
//!     → installed into the Runtime by the lifecycle orchestrator
//! ```
//!
//! # Design Decisions
//! - Backends are registered by key; unknown keys fail with a typed error
//! - Each backend satisfies exactly one capability contract
//! - The crate ships the `memory` family; external stores plug in through
//!   `AdapterFactory::register_*`

pub mod cache;
pub mod factory;
pub mod locker;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::queue::Queue;

pub use cache::{Cache, CacheError, MemoryCache};
pub use factory::AdapterFactory;
pub use locker::{Lease, LockError, Locker, MemoryLocker};

/// The concern an adapter serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Cache,
    Queue,
    Locker,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Cache => f.write_str("cache"),
            Capability::Queue => f.write_str("queue"),
            Capability::Locker => f.write_str("locker"),
        }
    }
}

/// Errors raised while constructing an adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The `type` discriminator names no registered backend.
    #[error("unknown {capability} adapter type {kind:?}")]
    UnknownType { capability: Capability, kind: String },

    /// The block has no `type`.
    #[error("{capability} adapter is not configured")]
    NotConfigured { capability: Capability },

    /// The options do not fit the backend.
    #[error("invalid options for {capability} adapter {kind:?}: {source}")]
    InvalidOptions {
        capability: Capability,
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// The backend could not be reached.
    #[error("{capability} adapter {kind:?} failed to connect: {reason}")]
    Connection {
        capability: Capability,
        kind: String,
        reason: String,
    },
}

impl AdapterError {
    /// True for errors caused by the configuration itself rather than by
    /// an unreachable backend.
    pub fn is_config_error(&self) -> bool {
        !matches!(self, AdapterError::Connection { .. })
    }
}

/// A constructed adapter, tagged by capability.
#[derive(Clone)]
pub enum Adapter {
    Cache(Arc<dyn Cache>),
    Queue(Arc<dyn Queue>),
    Locker(Arc<dyn Locker>),
}

impl Adapter {
    pub fn capability(&self) -> Capability {
        match self {
            Adapter::Cache(_) => Capability::Cache,
            Adapter::Queue(_) => Capability::Queue,
            Adapter::Locker(_) => Capability::Locker,
        }
    }

    /// Backend identifier of the wrapped adapter.
    pub fn kind(&self) -> &str {
        match self {
            Adapter::Cache(c) => c.kind(),
            Adapter::Queue(q) => q.kind(),
            Adapter::Locker(l) => l.kind(),
        }
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("capability", &self.capability())
            .field("kind", &self.kind())
            .finish()
    }
}

/// A backend family that can produce adapters of type `T`.
///
/// `name` is the queue name for queue backends and empty otherwise.
#[async_trait]
pub trait Backend<T: ?Sized>: Send + Sync {
    async fn connect(&self, name: &str, options: &Map<String, Value>) -> Result<Arc<T>, AdapterError>;
}

/// Deserialize a backend's typed options from the free-form map.
pub fn parse_options<O: DeserializeOwned>(
    capability: Capability,
    kind: &str,
    options: &Map<String, Value>,
) -> Result<O, AdapterError> {
    serde_json::from_value(Value::Object(options.clone())).map_err(|source| {
        AdapterError::InvalidOptions {
            capability,
            kind: kind.to_string(),
            source,
        }
    })
}
