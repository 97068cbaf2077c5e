//! HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     system.rs + application routers → engine.rs (router + route table)
//!     → server.rs takes the engine, adds middleware, binds
//!
//! Request:
//!     TraceLayer → TimeoutLayer → middleware.rs (operation log) → handler
//!         mutating request → "operate-log" message on the default queue
//! ```
//!
//! # Design Decisions
//! - Routes are registered through the engine so the route table always
//!   matches what is served
//! - Shutdown is bounded: in-flight requests get a deadline, then the
//!   server task is aborted

pub mod engine;
pub mod middleware;
pub mod server;
pub mod system;

pub use engine::{Engine, RouteInfo};
pub use server::{build_router, HttpServer, ServerTask};
