//! Audit persistence subsystem.
//!
//! # Data Flow
//! ```text
//! Login handler        → publish "login-log"   ─┐
//! Operate-log middleware → publish "operate-log" ├→ default queue → consumers.rs → AuditStore
//! Startup self-check   → publish "api-check"   ─┘
//! ```
//!
//! # Design Decisions
//! - Records travel as JSON payloads and are decoded by the consumer
//! - The store is a trait so persistence can move to a database without
//!   touching the consumers
//! - API inventory reconciliation is additive: routes already persisted are
//!   skipped, nothing is deleted

pub mod consumers;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::http::engine::RouteInfo;

pub use consumers::{register_consumers, SaveLoginLog, SaveOperateLog, SaveSysApi};
pub use store::{AuditError, AuditStore, FileAuditStore, MemoryAuditStore};

pub const LOGIN_LOG: &str = "login-log";
pub const OPERATE_LOG: &str = "operate-log";
pub const API_CHECK: &str = "api-check";

/// One login attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginLog {
    pub username: String,
    pub success: bool,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub login_at: DateTime<Utc>,
}

/// One mutating HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperateLog {
    pub method: String,
    pub path: String,
    pub status: u16,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub user_agent: String,
    pub latency_ms: u64,
    #[serde(default = "Utc::now")]
    pub operated_at: DateTime<Utc>,
}

/// Payload of an `api-check` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiInventory {
    pub list: Vec<RouteInfo>,
}
