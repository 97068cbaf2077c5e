//! HTTP server setup and shutdown.
//!
//! # Responsibilities
//! - Turn the runtime's engine into the served router
//! - Wire up middleware (operation log, timeout, tracing)
//! - Serve plain HTTP or TLS on an already bound listener
//! - Stop accepting on the shutdown signal and wait for in-flight requests,
//!   bounded by a deadline

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::from_fn_with_state;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::Mode;
use crate::http::middleware::operate_log;
use crate::lifecycle::LifecycleError;
use crate::runtime::{Runtime, RuntimeError};

/// Take the engine from the runtime and build the router that gets served.
///
/// Request tracing is left out in `prod` mode.
#[allow(deprecated)]
pub fn build_router(runtime: &Arc<Runtime>) -> Result<Router, RuntimeError> {
    let config = runtime.config();
    let engine = runtime.take_engine()?;

    let router = engine
        .into_router()
        .layer(from_fn_with_state(runtime.clone(), operate_log))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.application.request_timeout_secs,
        )));
    let router = match config.application.mode {
        Mode::Prod => router,
        _ => router.layer(TraceLayer::new_for_http()),
    };

    Ok(router.with_state(runtime.clone()))
}

/// HTTP server for the admin runtime.
pub struct HttpServer {
    router: Router,
    tls: Option<RustlsConfig>,
}

impl HttpServer {
    pub fn new(router: Router) -> Self {
        Self { router, tls: None }
    }

    /// Build from the runtime's engine. See [`build_router`].
    pub fn from_runtime(runtime: &Arc<Runtime>) -> Result<Self, RuntimeError> {
        Ok(Self::new(build_router(runtime)?))
    }

    pub fn with_tls(mut self, tls: RustlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Start serving on `listener` in a background task. The server stops
    /// accepting when `shutdown` fires and the task ends once in-flight
    /// requests complete.
    pub fn spawn(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> io::Result<ServerTask> {
        let local_addr = listener.local_addr()?;
        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        let join = match self.tls {
            None => {
                tracing::info!(address = %local_addr, "HTTP server starting");
                tokio::spawn(async move {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            let _ = shutdown.recv().await;
                        })
                        .await
                })
            }
            Some(tls) => {
                tracing::info!(address = %local_addr, "HTTPS server starting");
                let handle = axum_server::Handle::new();
                let signal = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown.recv().await;
                    signal.graceful_shutdown(None);
                });

                let listener = listener.into_std()?;
                tokio::spawn(async move {
                    axum_server::from_tcp_rustls(listener, tls)
                        .handle(handle)
                        .serve(app)
                        .await
                })
            }
        };

        Ok(ServerTask { local_addr, join })
    }
}

/// A running server.
pub struct ServerTask {
    local_addr: SocketAddr,
    join: JoinHandle<io::Result<()>>,
}

impl ServerTask {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the server to finish after the shutdown signal. If requests
    /// are still in flight at `deadline` the task is aborted and
    /// [`LifecycleError::ShutdownTimeout`] is returned.
    pub async fn drain(mut self, deadline: Duration) -> Result<(), LifecycleError> {
        match tokio::time::timeout(deadline, &mut self.join).await {
            Ok(Ok(Ok(()))) => {
                tracing::info!(address = %self.local_addr, "HTTP server stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(LifecycleError::Server(e)),
            Ok(Err(join_err)) => Err(LifecycleError::Server(io::Error::other(join_err))),
            Err(_) => {
                self.join.abort();
                tracing::error!(
                    address = %self.local_addr,
                    deadline_ms = deadline.as_millis() as u64,
                    "HTTP server did not drain before the deadline, aborting"
                );
                Err(LifecycleError::ShutdownTimeout { deadline })
            }
        }
    }

    /// Stop the server immediately.
    pub fn abort(&self) {
        self.join.abort();
    }
}
