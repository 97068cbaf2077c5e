//! Built-in system routes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::Method;
use axum::Json;
use serde::Serialize;

use crate::http::engine::{Engine, RouteInfo};
use crate::runtime::Runtime;

pub const HEALTH_PATH: &str = "/health";
pub const ROUTES_PATH: &str = "/api/v1/sys/routes";

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub name: String,
    pub mode: String,
    pub cache: Option<String>,
    pub queue: Option<String>,
    pub locker: Option<String>,
    pub queues: usize,
}

pub fn register(engine: &mut Engine) {
    engine
        .route(Method::GET, HEALTH_PATH, health)
        .route(Method::GET, ROUTES_PATH, routes);
}

async fn health(State(runtime): State<Arc<Runtime>>) -> Json<HealthReport> {
    let config = runtime.config();
    Json(HealthReport {
        status: "ok",
        name: config.application.name.clone(),
        mode: config.application.mode.to_string(),
        cache: runtime.cache_adapter().map(|a| a.kind().to_string()),
        queue: runtime.queue_adapter().map(|a| a.kind().to_string()),
        locker: runtime.locker_adapter().map(|a| a.kind().to_string()),
        queues: runtime.queues().len(),
    })
}

async fn routes(State(runtime): State<Arc<Runtime>>) -> Json<Vec<RouteInfo>> {
    Json(runtime.routes())
}
