//! Adapter factory: selects a backend by `type` and constructs it.
//!
//! # Responsibilities
//! - Keep one `type → backend` table per capability
//! - Reject unknown `type` values with a typed error
//! - Treat blocks without a `type` as "not configured"

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapters::cache::MemoryCacheBackend;
use crate::adapters::locker::MemoryLockerBackend;
use crate::adapters::{Adapter, AdapterError, Backend, Cache, Capability, Locker};
use crate::config::AdapterConfig;
use crate::queue::{MemoryQueueBackend, Queue};

/// Registered backends for one capability, keyed by `type`.
struct BackendTable<T: ?Sized> {
    capability: Capability,
    backends: BTreeMap<String, Arc<dyn Backend<T>>>,
}

impl<T: ?Sized> BackendTable<T> {
    fn new(capability: Capability) -> Self {
        Self {
            capability,
            backends: BTreeMap::new(),
        }
    }

    fn insert(&mut self, kind: &str, backend: Arc<dyn Backend<T>>) {
        self.backends.insert(kind.to_string(), backend);
    }

    fn kinds(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    async fn connect(&self, name: &str, config: &AdapterConfig) -> Result<Arc<T>, AdapterError> {
        if config.is_empty() {
            return Err(AdapterError::NotConfigured { capability: self.capability });
        }
        let kind = config.kind.trim();
        let backend = self
            .backends
            .get(kind)
            .ok_or_else(|| AdapterError::UnknownType {
                capability: self.capability,
                kind: kind.to_string(),
            })?;

        let adapter = backend.connect(name, &config.options).await?;
        tracing::debug!(capability = %self.capability, kind, name, "Adapter constructed");
        Ok(adapter)
    }
}

/// Builds cache, queue and locker adapters from configuration blocks.
pub struct AdapterFactory {
    caches: BackendTable<dyn Cache>,
    queues: BackendTable<dyn Queue>,
    lockers: BackendTable<dyn Locker>,
}

impl AdapterFactory {
    /// A factory with no registered backends.
    pub fn empty() -> Self {
        Self {
            caches: BackendTable::new(Capability::Cache),
            queues: BackendTable::new(Capability::Queue),
            lockers: BackendTable::new(Capability::Locker),
        }
    }

    /// A factory with the `memory` backend registered for every capability.
    pub fn with_builtins() -> Self {
        let mut factory = Self::empty();
        factory.register_cache("memory", MemoryCacheBackend);
        factory.register_queue("memory", MemoryQueueBackend);
        factory.register_locker("memory", MemoryLockerBackend);
        factory
    }

    pub fn register_cache(&mut self, kind: &str, backend: impl Backend<dyn Cache> + 'static) -> &mut Self {
        self.caches.insert(kind, Arc::new(backend));
        self
    }

    pub fn register_queue(&mut self, kind: &str, backend: impl Backend<dyn Queue> + 'static) -> &mut Self {
        self.queues.insert(kind, Arc::new(backend));
        self
    }

    pub fn register_locker(&mut self, kind: &str, backend: impl Backend<dyn Locker> + 'static) -> &mut Self {
        self.lockers.insert(kind, Arc::new(backend));
        self
    }

    /// Registered backend identifiers for a capability.
    pub fn kinds(&self, capability: Capability) -> Vec<&str> {
        match capability {
            Capability::Cache => self.caches.kinds(),
            Capability::Queue => self.queues.kinds(),
            Capability::Locker => self.lockers.kinds(),
        }
    }

    /// Construct an adapter for `capability` from a configuration block.
    pub async fn setup(&self, capability: Capability, config: &AdapterConfig) -> Result<Adapter, AdapterError> {
        Ok(match capability {
            Capability::Cache => Adapter::Cache(self.setup_cache(config).await?),
            Capability::Queue => Adapter::Queue(self.setup_queue("", config).await?),
            Capability::Locker => Adapter::Locker(self.setup_locker(config).await?),
        })
    }

    pub async fn setup_cache(&self, config: &AdapterConfig) -> Result<Arc<dyn Cache>, AdapterError> {
        self.caches.connect("", config).await
    }

    /// Construct a queue adapter named `name` (empty for the default queue).
    pub async fn setup_queue(&self, name: &str, config: &AdapterConfig) -> Result<Arc<dyn Queue>, AdapterError> {
        self.queues.connect(name, config).await
    }

    pub async fn setup_locker(&self, config: &AdapterConfig) -> Result<Arc<dyn Locker>, AdapterError> {
        self.lockers.connect("", config).await
    }
}

impl Default for AdapterFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}
