//! Admin runtime library.
//!
//! Builds cache, queue and locker adapters from configuration, keeps them in
//! a shared [`Runtime`], runs in-process named event queues with audit
//! consumers, and serves HTTP with a bounded graceful shutdown.

pub mod adapters;
pub mod audit;
pub mod captcha;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod queue;
pub mod runtime;

pub use config::AppConfig;
pub use http::HttpServer;
pub use lifecycle::{LifecycleError, Orchestrator, Shutdown};
pub use runtime::Runtime;
