//! Operation-log middleware.
//!
//! Publishes an `operate-log` message on the default queue for every
//! mutating request, after the response is produced. Publishing failures are
//! logged and never change the response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;

use crate::audit::{OperateLog, OPERATE_LOG};
use crate::observability::metrics;
use crate::runtime::{Runtime, DEFAULT_QUEUE};

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// First `x-forwarded-for` hop, then `x-real-ip`, then the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

pub async fn operate_log(State(runtime): State<Arc<Runtime>>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();

    if !is_mutating(&method) {
        let response = next.run(request).await;
        metrics::record_http_request(method.as_str(), response.status().as_u16());
        return response;
    }

    let path = request.uri().path().to_string();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), peer);
    let user_agent = request
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let response = next.run(request).await;
    let status = response.status().as_u16();
    metrics::record_http_request(method.as_str(), status);

    let record = OperateLog {
        method: method.to_string(),
        path,
        status,
        ip,
        user_agent,
        latency_ms: started.elapsed().as_millis() as u64,
        operated_at: Utc::now(),
    };
    if let Err(e) = runtime.publish(DEFAULT_QUEUE, OPERATE_LOG, &record).await {
        tracing::warn!(
            error = %e,
            method = %record.method,
            path = %record.path,
            "Failed to publish operation log"
        );
    }

    response
}
