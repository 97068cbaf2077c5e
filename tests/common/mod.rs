//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use admin_runtime::config::Mode;
use admin_runtime::lifecycle::Running;
use admin_runtime::{AppConfig, Orchestrator};
use tokio::net::TcpListener;

/// Config for a server on an ephemeral loopback port with a short shutdown
/// deadline.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.application.host = "127.0.0.1".into();
    config.application.port = 0;
    config.application.mode = Mode::Test;
    config.application.shutdown_timeout_secs = 1;
    config
}

/// Start the orchestrator on an ephemeral port.
pub async fn start(orchestrator: Orchestrator) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    orchestrator.start_on(listener).await.unwrap()
}

pub fn url(running: &Running, path: &str) -> String {
    format!("http://{}{}", running.local_addr(), path)
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
