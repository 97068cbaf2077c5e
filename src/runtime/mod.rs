//! Runtime registry.
//!
//! # Responsibilities
//! - Hold the active cache, queue and locker adapters
//! - Hold database handles by name (`*` is the primary)
//! - Hand out named event queues, creating them on first lookup
//! - Run every queue's dispatch loop once started, and stop them on shutdown
//! - Own the HTTP engine until the server takes it, and keep its route table
//!
//! # Design Decisions
//! - One `Arc<Runtime>` is built at startup and passed to every component
//! - Slots are written during startup only; setting an occupied slot fails
//! - Reads go through `RwLock`/`ArcSwap` so request handlers and background
//!   loops can read concurrently

pub mod database;
mod loops;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::adapters::{AdapterError, AdapterFactory, Cache, Capability, Locker};
use crate::captcha::{CacheCaptchaStore, CAPTCHA_TTL};
use crate::config::{AdapterConfig, AppConfig, STARTUP_ONLY};
use crate::http::engine::{Engine, RouteInfo};
use crate::queue::{MemoryQueue, MemoryQueueOptions, Message, NamedQueue, Queue, QueueError};

pub use database::DatabaseHandle;

use loops::QueueLoops;

/// Name of the primary database.
pub const PRIMARY_DB: &str = "*";

/// Name of the default event queue.
pub const DEFAULT_QUEUE: &str = "";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} adapter is already set")]
    AdapterAlreadySet(Capability),
    #[error("{0} adapter is not set")]
    AdapterNotSet(Capability),
    #[error("unknown database {0:?}")]
    UnknownDatabase(String),
    #[error("unknown queue {0:?}")]
    UnknownQueue(String),
    #[error("message topic must not be empty")]
    EmptyTopic,
    #[error("failed to encode message payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("the HTTP engine has already been taken by the server")]
    EngineTaken,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn closed(name: &str) -> RuntimeError {
    RuntimeError::Queue(QueueError::Closed { queue: name.to_string() })
}

fn fill<T>(lock: &RwLock<Option<T>>, value: T, capability: Capability) -> Result<(), RuntimeError> {
    let mut slot = lock.write().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(RuntimeError::AdapterAlreadySet(capability));
    }
    *slot = Some(value);
    Ok(())
}

/// Process-wide context built once by the lifecycle orchestrator.
pub struct Runtime {
    config: ArcSwap<AppConfig>,
    factory: Arc<AdapterFactory>,
    /// Queue block as loaded at startup; named queues are built from it.
    queue_config: AdapterConfig,
    cache: RwLock<Option<Arc<dyn Cache>>>,
    queue: RwLock<Option<Arc<dyn Queue>>>,
    locker: RwLock<Option<Arc<dyn Locker>>>,
    databases: RwLock<HashMap<String, Arc<DatabaseHandle>>>,
    queues: DashMap<String, NamedQueue>,
    loops: Mutex<QueueLoops>,
    engine: Mutex<Option<Engine>>,
    routes: RwLock<Vec<RouteInfo>>,
}

impl Runtime {
    pub fn new(config: AppConfig, factory: Arc<AdapterFactory>) -> Self {
        Self {
            queue_config: config.queue.clone(),
            config: ArcSwap::from_pointee(config),
            factory,
            cache: RwLock::new(None),
            queue: RwLock::new(None),
            locker: RwLock::new(None),
            databases: RwLock::new(HashMap::new()),
            queues: DashMap::new(),
            loops: Mutex::new(QueueLoops::Idle),
            engine: Mutex::new(Some(Engine::new())),
            routes: RwLock::new(Vec::new()),
        }
    }

    // --- Configuration ---

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config.load_full()
    }

    /// Swap in a reloaded configuration. Sections in [`STARTUP_ONLY`] were
    /// consumed while starting; changes to them are reported and take effect
    /// after a restart. Returns true if such changes were found.
    pub fn reload_config(&self, next: AppConfig) -> bool {
        let ignored: Vec<_> = self
            .config
            .load()
            .changed_sections(&next)
            .into_iter()
            .filter(|section| STARTUP_ONLY.contains(section))
            .collect();
        if !ignored.is_empty() {
            tracing::warn!(sections = ?ignored, "Reloaded config changes startup-only sections; restart to apply them");
        }

        self.config.store(Arc::new(next));
        tracing::info!("Configuration reloaded");
        !ignored.is_empty()
    }

    // --- Adapters ---

    pub fn set_cache_adapter(&self, adapter: Arc<dyn Cache>) -> Result<(), RuntimeError> {
        fill(&self.cache, adapter, Capability::Cache)
    }

    pub fn cache_adapter(&self) -> Option<Arc<dyn Cache>> {
        read(&self.cache)
    }

    /// Install the queue adapter. Fails once the default queue has been
    /// handed out, since it would keep using the fallback backend.
    pub fn set_queue_adapter(&self, adapter: Arc<dyn Queue>) -> Result<(), RuntimeError> {
        if self.queues.contains_key(DEFAULT_QUEUE) {
            return Err(RuntimeError::AdapterAlreadySet(Capability::Queue));
        }
        fill(&self.queue, adapter, Capability::Queue)
    }

    pub fn queue_adapter(&self) -> Option<Arc<dyn Queue>> {
        read(&self.queue)
    }

    pub fn set_locker_adapter(&self, adapter: Arc<dyn Locker>) -> Result<(), RuntimeError> {
        fill(&self.locker, adapter, Capability::Locker)
    }

    pub fn locker_adapter(&self) -> Option<Arc<dyn Locker>> {
        read(&self.locker)
    }

    pub fn factory(&self) -> &Arc<AdapterFactory> {
        &self.factory
    }

    /// Captcha store on top of the cache adapter.
    pub fn captcha(&self) -> Result<CacheCaptchaStore, RuntimeError> {
        let cache = self
            .cache_adapter()
            .ok_or(RuntimeError::AdapterNotSet(Capability::Cache))?;
        Ok(CacheCaptchaStore::new(cache, CAPTCHA_TTL))
    }

    // --- Databases ---

    pub fn set_db(&self, handle: DatabaseHandle) {
        let mut dbs = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        dbs.insert(handle.name.clone(), Arc::new(handle));
    }

    /// Look up a database by name; `*` is the primary.
    pub fn db(&self, name: &str) -> Result<Arc<DatabaseHandle>, RuntimeError> {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownDatabase(name.to_string()))
    }

    pub fn dbs(&self) -> HashMap<String, Arc<DatabaseHandle>> {
        read(&self.databases)
    }

    // --- Event queues ---

    /// The named queue, created on first lookup.
    ///
    /// The default queue uses the queue adapter when one is set. Other names
    /// get their own instance from the configured queue block, or the
    /// in-memory fallback when no queue is configured. Once the run loops
    /// are started, a new queue gets its loop immediately.
    pub async fn queue(&self, name: &str) -> Result<NamedQueue, RuntimeError> {
        self.queue_with(name, |_| Ok(())).await
    }

    /// Like [`Runtime::queue`], but runs `setup` on the queue before its run
    /// loop can start. Use it to register handlers on a queue created while
    /// serving. For an existing queue `setup` runs as is, so registering on a
    /// running queue fails with [`QueueError::RegisterAfterRun`].
    pub async fn queue_with<F>(&self, name: &str, setup: F) -> Result<NamedQueue, RuntimeError>
    where
        F: FnOnce(&NamedQueue) -> Result<(), QueueError>,
    {
        if let Some(existing) = self.queues.get(name).map(|q| q.value().clone()) {
            setup(&existing)?;
            return Ok(existing);
        }
        if self.lock_loops().is_stopped() {
            return Err(closed(name));
        }

        let backend: Arc<dyn Queue> = match (name, self.queue_adapter()) {
            (DEFAULT_QUEUE, Some(adapter)) => adapter,
            _ if !self.queue_config.is_empty() => self.factory.setup_queue(name, &self.queue_config).await?,
            _ => Arc::new(MemoryQueue::new(name, MemoryQueueOptions::default())),
        };
        let created = NamedQueue::new(name, backend);

        let queue = match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                drop(entry);
                setup(&existing)?;
                return Ok(existing);
            }
            Entry::Vacant(entry) => {
                setup(&created)?;
                entry.insert(created.clone());
                created
            }
        };

        let mut loops = self.lock_loops();
        if loops.is_stopped() {
            self.queues.remove(name);
            return Err(closed(name));
        }
        loops.spawn(&queue);
        Ok(queue)
    }

    /// Every queue created so far.
    pub fn queues(&self) -> Vec<NamedQueue> {
        self.queues.iter().map(|q| q.value().clone()).collect()
    }

    /// Start a run loop for every queue created so far and for every queue
    /// created from now on. Returns once each loop is running.
    pub async fn start_queues(&self) -> usize {
        let started = {
            let mut loops = self.lock_loops();
            if !loops.start() {
                return 0;
            }
            let queues = self.queues();
            for queue in &queues {
                loops.spawn(queue);
            }
            queues.len()
        };
        while !self.queues_started() {
            tokio::task::yield_now().await;
        }
        started
    }

    /// Signal every run loop to stop and wait until each has drained. New
    /// queues are refused from here on.
    pub async fn stop_queues(&self) -> usize {
        let tasks = self.lock_loops().stop();
        loops::join(tasks).await
    }

    fn queues_started(&self) -> bool {
        self.lock_loops().all_started()
    }

    fn lock_loops(&self) -> std::sync::MutexGuard<'_, QueueLoops> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build a message for `topic` on the named queue without sending it.
    pub fn stream_message(
        &self,
        queue_name: &str,
        topic: &str,
        payload: impl Serialize,
    ) -> Result<Message, RuntimeError> {
        if !self.queues.contains_key(queue_name) {
            return Err(RuntimeError::UnknownQueue(queue_name.to_string()));
        }
        if topic.is_empty() {
            return Err(RuntimeError::EmptyTopic);
        }
        let payload = serde_json::to_value(payload)?;
        Ok(Message::new(queue_name, topic, payload))
    }

    /// Build a message and append it to the named queue.
    pub async fn publish(&self, queue_name: &str, topic: &str, payload: impl Serialize) -> Result<(), RuntimeError> {
        let queue = self.queue(queue_name).await?;
        let message = self.stream_message(queue_name, topic, payload)?;
        queue.append(message).await?;
        Ok(())
    }

    // --- HTTP engine ---

    /// Register routes on the engine. Fails after the server took it.
    pub fn with_engine(&self, f: impl FnOnce(&mut Engine)) -> Result<(), RuntimeError> {
        let mut guard = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        let engine = guard.as_mut().ok_or(RuntimeError::EngineTaken)?;
        f(engine);

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        *routes = engine.routes().to_vec();
        Ok(())
    }

    /// Hand the engine to the HTTP server. The route table stays readable.
    pub fn take_engine(&self) -> Result<Engine, RuntimeError> {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RuntimeError::EngineTaken)
    }

    /// Registered routes, in registration order.
    pub fn routes(&self) -> Vec<RouteInfo> {
        read(&self.routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryCache;
    use crate::config::DatabaseConfig;
    use axum::http::Method;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn runtime(config: AppConfig) -> Runtime {
        Runtime::new(config, Arc::new(AdapterFactory::with_builtins()))
    }

    #[test]
    fn test_adapter_slots_are_set_once() {
        let rt = runtime(AppConfig::default());
        assert!(rt.cache_adapter().is_none());
        assert!(rt.captcha().is_err());

        rt.set_cache_adapter(Arc::new(MemoryCache::default())).unwrap();
        assert!(rt.cache_adapter().is_some());
        assert!(rt.captcha().is_ok());
        assert!(matches!(
            rt.set_cache_adapter(Arc::new(MemoryCache::default())),
            Err(RuntimeError::AdapterAlreadySet(Capability::Cache))
        ));
    }

    #[test]
    fn test_db_lookup() {
        let rt = runtime(AppConfig::default());
        assert!(matches!(rt.db(PRIMARY_DB), Err(RuntimeError::UnknownDatabase(_))));

        let primary = DatabaseConfig {
            driver: "sqlite3".into(),
            source: "admin.db".into(),
            ..Default::default()
        };
        rt.set_db(DatabaseHandle::from_config(PRIMARY_DB, &primary));
        assert_eq!(rt.db("*").unwrap().driver, "sqlite3");
        assert!(matches!(rt.db("reports"), Err(RuntimeError::UnknownDatabase(n)) if n == "reports"));
    }

    #[tokio::test]
    async fn test_queues_are_created_lazily_and_shared() {
        let rt = runtime(AppConfig::default());
        assert!(matches!(
            rt.stream_message("", "login-log", json!({})),
            Err(RuntimeError::UnknownQueue(_))
        ));

        let first = rt.queue("").await.unwrap();
        let second = rt.queue("").await.unwrap();
        assert!(Arc::ptr_eq(first.backend(), second.backend()));
        assert_eq!(rt.queues().len(), 1);

        assert!(rt.stream_message("", "login-log", json!({})).is_ok());
        assert!(matches!(rt.stream_message("", "", json!({})), Err(RuntimeError::EmptyTopic)));
    }

    #[tokio::test]
    async fn test_default_queue_uses_adapter() {
        let rt = runtime(AppConfig::default());
        let adapter: Arc<dyn Queue> = Arc::new(MemoryQueue::new("", MemoryQueueOptions::default()));
        rt.set_queue_adapter(adapter.clone()).unwrap();

        let queue = rt.queue(DEFAULT_QUEUE).await.unwrap();
        assert!(Arc::ptr_eq(queue.backend(), &adapter));

        let other = rt.queue("jobs").await.unwrap();
        assert!(!Arc::ptr_eq(other.backend(), &adapter));
        assert_eq!(other.backend().name(), "jobs");
    }

    #[tokio::test]
    async fn test_queue_adapter_rejected_after_default_queue_in_use() {
        let rt = runtime(AppConfig::default());
        rt.queue("").await.unwrap();
        let adapter: Arc<dyn Queue> = Arc::new(MemoryQueue::new("", MemoryQueueOptions::default()));
        assert!(rt.set_queue_adapter(adapter).is_err());
        assert!(rt.queue_adapter().is_none());
    }

    #[tokio::test]
    async fn test_login_message_reaches_handler() {
        let mut config = AppConfig::default();
        config.queue = AdapterConfig::new("memory");
        let rt = runtime(config.clone());
        let adapter = rt.factory().setup_queue("", &config.queue).await.unwrap();
        rt.set_queue_adapter(adapter).unwrap();

        let received: Arc<StdMutex<Vec<Arc<Message>>>> = Default::default();
        let sink = received.clone();
        let queue = rt.queue("").await.unwrap();
        queue
            .register("login-log", move |message: Arc<Message>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(message);
                    Ok::<(), crate::queue::HandlerError>(())
                }
            })
            .unwrap();

        let message = rt.stream_message("", "login-log", json!({"user": "alice"})).unwrap();
        queue.append(message).await.unwrap();
        assert_eq!(queue.run_once().await.unwrap(), 1);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload(), &json!({"user": "alice"}));
    }

    #[tokio::test]
    async fn test_started_loops_cover_new_queues_until_stopped() {
        let rt = runtime(AppConfig::default());
        let early = rt.queue("").await.unwrap();
        assert_eq!(rt.start_queues().await, 1);
        assert!(early.is_running());
        assert_eq!(rt.start_queues().await, 0);

        let late = rt.queue("jobs").await.unwrap();
        while !late.is_running() {
            tokio::task::yield_now().await;
        }

        assert_eq!(rt.stop_queues().await, 2);
        assert!(!early.is_running() && !late.is_running());
        assert!(matches!(
            rt.queue("reports").await,
            Err(RuntimeError::Queue(QueueError::Closed { .. }))
        ));
        assert_eq!(rt.queues().len(), 2);
    }

    #[test]
    fn test_engine_is_taken_once() {
        async fn ok() -> &'static str {
            "ok"
        }

        let rt = runtime(AppConfig::default());
        rt.with_engine(|engine| {
            engine.route(Method::GET, "/health", ok);
        })
        .unwrap();
        assert_eq!(rt.routes().len(), 1);

        let engine = rt.take_engine().unwrap();
        assert_eq!(engine.routes().len(), 1);
        assert!(matches!(rt.take_engine(), Err(RuntimeError::EngineTaken)));
        assert!(matches!(rt.with_engine(|_| {}), Err(RuntimeError::EngineTaken)));
        assert_eq!(rt.routes()[0].path, "/health");
    }

    #[test]
    fn test_reload_reports_startup_only_changes() {
        let rt = runtime(AppConfig::default());
        let mut next = AppConfig::default();
        next.application.shutdown_timeout_secs = 9;
        assert!(!rt.reload_config(next.clone()));
        assert_eq!(rt.config().application.shutdown_timeout_secs, 9);

        next.logger.level = "debug".into();
        assert!(rt.reload_config(next.clone()));
        assert_eq!(rt.config().logger.level, "debug");

        next.queue = AdapterConfig::new("memory");
        assert!(rt.reload_config(next));
        assert!(!rt.config().queue.is_empty());
    }
}
