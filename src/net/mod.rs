//! Network layer.
//!
//! Listeners are plain `tokio::net::TcpListener`s bound by the lifecycle
//! orchestrator; this module only adds optional TLS on top.

pub mod tls;
