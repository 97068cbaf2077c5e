//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Build the adapters and databases into the runtime, in dependency order
//! - Register the audit consumers and start the queue run loops
//! - Register routes, run the optional API self-check, then start serving
//! - Drive the bounded shutdown once the process is interrupted: the server
//!   drains first, then the queues, so records published by in-flight
//!   requests are still dispatched
//!
//! # Design Decisions
//! - Fail fast: any construction error is fatal and names the capability
//! - Subsystems initialize in order, not concurrently
//! - The listener starts last (traffic only when consumers are ready)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::RecommendedWatcher;
use tokio::net::TcpListener;

use super::{signals, Lifecycle, LifecycleError, Phase, Shutdown};
use crate::adapters::{AdapterError, AdapterFactory, Capability};
use crate::audit::{register_consumers, ApiInventory, AuditStore, FileAuditStore, MemoryAuditStore, API_CHECK};
use crate::captcha::CAPTCHA_TTL;
use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, AdapterConfig, AppConfig};
use crate::http::{system, Engine, HttpServer, ServerTask};
use crate::net::tls;
use crate::observability::metrics;
use crate::runtime::database::database_handles;
use crate::runtime::{Runtime, DEFAULT_QUEUE};

type RouterFn = Box<dyn FnOnce(&mut Engine) + Send>;

fn adapter_error(capability: Capability) -> impl FnOnce(AdapterError) -> LifecycleError {
    move |source| LifecycleError::Adapter { capability, source }
}

/// Build the configured adapters and install them into the runtime.
///
/// The cache is required: an empty cache block falls back to the in-memory
/// cache. Empty queue and locker blocks leave their slots unset. A failure
/// leaves the failing slot unset.
pub async fn install_adapters(runtime: &Runtime, config: &AppConfig) -> Result<(), LifecycleError> {
    let factory = runtime.factory().clone();

    let cache_config = if config.cache.is_empty() {
        tracing::info!("No cache configured, using the in-memory cache");
        AdapterConfig::new("memory")
    } else {
        config.cache.clone()
    };
    let cache = factory
        .setup_cache(&cache_config)
        .await
        .map_err(adapter_error(Capability::Cache))?;
    tracing::info!(kind = cache.kind(), "Cache adapter ready");
    runtime.set_cache_adapter(cache)?;

    if !config.queue.is_empty() {
        let queue = factory
            .setup_queue(DEFAULT_QUEUE, &config.queue)
            .await
            .map_err(adapter_error(Capability::Queue))?;
        tracing::info!(kind = queue.kind(), "Queue adapter ready");
        runtime.set_queue_adapter(queue)?;
    }

    if !config.locker.is_empty() {
        let locker = factory
            .setup_locker(&config.locker)
            .await
            .map_err(adapter_error(Capability::Locker))?;
        tracing::info!(kind = locker.kind(), "Locker adapter ready");
        runtime.set_locker_adapter(locker)?;
    }

    Ok(())
}

/// Builder for a server process.
pub struct Orchestrator {
    config: AppConfig,
    config_path: Option<PathBuf>,
    factory: AdapterFactory,
    audit_store: Option<Arc<dyn AuditStore>>,
    routers: Vec<RouterFn>,
    api_check: bool,
    lifecycle: Lifecycle,
}

impl Orchestrator {
    /// Start from an already loaded configuration.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            config_path: None,
            factory: AdapterFactory::with_builtins(),
            audit_store: None,
            routers: Vec::new(),
            api_check: false,
            lifecycle: Lifecycle::configured(),
        }
    }

    /// Load and validate the configuration file. The file is watched for
    /// changes once the server runs.
    pub fn from_path(path: &Path) -> Result<Self, LifecycleError> {
        let config = load_config(path)?;
        Ok(Self::new(config).with_config_path(path))
    }

    /// Watch this file for configuration changes while serving.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    /// Use a factory with additional registered backends.
    pub fn with_factory(mut self, factory: AdapterFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Persist audit records here instead of the configured store.
    pub fn with_audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    /// Add an application router. Routers run in the order they were added,
    /// after the system routes.
    pub fn with_router(mut self, router: impl FnOnce(&mut Engine) + Send + 'static) -> Self {
        self.routers.push(Box::new(router));
        self
    }

    /// Enqueue the route inventory on `api-check` at startup.
    pub fn with_api_check(mut self, enabled: bool) -> Self {
        self.api_check = enabled;
        self
    }

    /// Bind the configured address and start.
    pub async fn start(self) -> Result<Running, LifecycleError> {
        let address = self.config.application.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| LifecycleError::Bind { address, source })?;
        self.start_on(listener).await
    }

    /// Run every startup step and serve on `listener`.
    pub async fn start_on(self, listener: TcpListener) -> Result<Running, LifecycleError> {
        let Orchestrator {
            config,
            config_path,
            factory,
            audit_store,
            routers,
            api_check,
            lifecycle,
        } = self;

        if config.metrics.enabled {
            match config.metrics.address.parse::<SocketAddr>() {
                Ok(addr) => metrics::init_metrics(addr),
                Err(e) => tracing::error!(
                    metrics_address = %config.metrics.address,
                    error = %e,
                    "Failed to parse metrics address"
                ),
            }
        }
        let tls = tls::from_ssl_config(&config.ssl).await.map_err(LifecycleError::Tls)?;

        // Adapters and databases.
        let runtime = Arc::new(Runtime::new(config.clone(), Arc::new(factory)));
        install_adapters(&runtime, &config).await?;
        for handle in database_handles(&config) {
            tracing::info!(
                name = %handle.name,
                driver = %handle.driver,
                source = %handle.redacted_source(),
                "Database registered"
            );
            runtime.set_db(handle);
        }
        runtime.captcha()?;
        tracing::debug!(ttl_secs = CAPTCHA_TTL.as_secs(), "Captcha store ready");
        lifecycle.advance(Phase::AdaptersReady)?;

        // Consumers, then the run loops.
        let store: Arc<dyn AuditStore> = match (audit_store, &config.audit.dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileAuditStore::open(dir)?),
            (None, None) => Arc::new(MemoryAuditStore::new()),
        };
        let default_queue = runtime.queue(DEFAULT_QUEUE).await?;
        register_consumers(&default_queue, store)?;
        lifecycle.advance(Phase::ConsumersRegistered)?;

        let queues = runtime.start_queues().await;
        tracing::debug!(queues, "Queue run loops started");

        // Routes.
        runtime.with_engine(system::register)?;
        for router in routers {
            runtime.with_engine(router)?;
        }
        if api_check {
            api_self_check(&runtime).await;
        }

        let mut server = HttpServer::from_runtime(&runtime)?;
        let secure = tls.is_some();
        if let Some(tls) = tls {
            server = server.with_tls(tls);
        }
        let shutdown = Shutdown::new();
        let server = server
            .spawn(listener, shutdown.subscribe())
            .map_err(LifecycleError::Server)?;
        lifecycle.advance(Phase::Serving)?;
        log_banner(&config, server.local_addr(), secure);

        Ok(Running {
            runtime,
            shutdown,
            server,
            lifecycle,
            config_path,
        })
    }

    /// Start, serve until interrupted, then shut down.
    pub async fn run(self) -> Result<(), LifecycleError> {
        let running = self.start().await?;
        let _watcher = running.watch_config();

        if let Err(e) = signals::interrupt().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signals, shutting down");
        }
        running.shutdown().await
    }
}

/// Enqueue the route inventory. Failures are logged; startup continues.
async fn api_self_check(runtime: &Runtime) {
    let inventory = ApiInventory { list: runtime.routes() };
    let count = inventory.list.len();
    match runtime.publish(DEFAULT_QUEUE, API_CHECK, &inventory).await {
        Ok(()) => tracing::info!(routes = count, "API self-check enqueued"),
        Err(e) => tracing::warn!(error = %e, "API self-check failed"),
    }
}

fn network_host(addr: SocketAddr) -> String {
    if !addr.ip().is_unspecified() {
        return addr.ip().to_string();
    }
    // Connecting a UDP socket sends nothing; it only picks the outbound interface.
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|local| local.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn log_banner(config: &AppConfig, addr: SocketAddr, secure: bool) {
    let scheme = if secure { "https" } else { "http" };
    let port = addr.port();
    tracing::info!(
        name = %config.application.name,
        mode = %config.application.mode,
        local = %format!("{scheme}://localhost:{port}/"),
        network = %format!("{scheme}://{}:{port}/", network_host(addr)),
        "Server run at"
    );
    tracing::info!("Press Ctrl+C to shut down");
}

/// A started server process.
pub struct Running {
    runtime: Arc<Runtime>,
    /// Stops the HTTP server only; queues are stopped through the runtime.
    shutdown: Shutdown,
    server: ServerTask,
    lifecycle: Lifecycle,
    config_path: Option<PathBuf>,
}

impl Running {
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    /// Watch the config file and feed reloads into the runtime. The returned
    /// watcher must be kept alive.
    pub fn watch_config(&self) -> Option<RecommendedWatcher> {
        let path = self.config_path.as_ref()?;
        let (watcher, mut updates) = ConfigWatcher::new(path, self.runtime.config().as_ref().clone());
        let watcher = match watcher.run() {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                return None;
            }
        };

        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            while let Some(next) = updates.recv().await {
                runtime.reload_config(next);
            }
        });
        Some(watcher)
    }

    /// Stop accepting, wait for in-flight requests up to the shutdown
    /// deadline, then let every queue drain.
    ///
    /// Queues keep accepting until the server has stopped, so messages
    /// published by the last requests are dispatched too. Returns
    /// [`LifecycleError::ShutdownTimeout`] if requests were still running at
    /// the deadline. Queues are drained either way.
    pub async fn shutdown(self) -> Result<(), LifecycleError> {
        self.lifecycle.advance(Phase::Draining)?;
        // Read at shutdown so a reloaded timeout applies.
        let deadline = Duration::from_secs(self.runtime.config().application.shutdown_timeout_secs);
        tracing::info!(deadline_ms = deadline.as_millis() as u64, "Shutting down server");
        self.shutdown.trigger();

        let served = self.server.drain(deadline).await;

        let stopped = self.runtime.stop_queues().await;
        tracing::info!(queues = stopped, "Queues drained");

        self.lifecycle.advance(Phase::Stopped)?;
        match &served {
            Ok(()) => tracing::info!("Server exiting"),
            Err(e) => tracing::error!(error = %e, "Server exiting after failed shutdown"),
        }
        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_cache_falls_back_to_memory() {
        let config = AppConfig::default();
        let runtime = Runtime::new(config.clone(), Arc::new(AdapterFactory::with_builtins()));
        install_adapters(&runtime, &config).await.unwrap();

        assert_eq!(runtime.cache_adapter().unwrap().kind(), "memory");
        assert!(runtime.queue_adapter().is_none());
        assert!(runtime.locker_adapter().is_none());
    }

    #[tokio::test]
    async fn test_unknown_locker_leaves_slot_unset() {
        let mut config = AppConfig::default();
        config.queue = AdapterConfig::new("memory");
        config.locker = AdapterConfig::new("zookeeper");
        let runtime = Runtime::new(config.clone(), Arc::new(AdapterFactory::with_builtins()));

        let err = install_adapters(&runtime, &config).await.unwrap_err();
        assert!(err.is_config_error());
        assert!(matches!(err, LifecycleError::Adapter { capability: Capability::Locker, .. }));
        assert!(runtime.queue_adapter().is_some());
        assert!(runtime.locker_adapter().is_none());
    }

    #[test]
    fn test_network_host_keeps_specific_ip() {
        let addr: SocketAddr = "10.1.2.3:8000".parse().unwrap();
        assert_eq!(network_host(addr), "10.1.2.3");
    }
}
