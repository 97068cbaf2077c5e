//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the admin
//! runtime. All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Root configuration document.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings (bind host/port, run mode).
    pub application: ApplicationConfig,

    /// Optional TLS settings for the HTTP listener.
    pub ssl: SslConfig,

    /// Logger settings.
    pub logger: LoggerConfig,

    /// Metrics exporter settings.
    pub metrics: MetricsConfig,

    /// Primary database, registered under the `*` name.
    pub database: Option<DatabaseConfig>,

    /// Additional named databases.
    pub databases: BTreeMap<String, DatabaseConfig>,

    /// Cache adapter block.
    pub cache: AdapterConfig,

    /// Queue adapter block. Empty means the in-memory fallback is used.
    pub queue: AdapterConfig,

    /// Distributed locker adapter block. Empty means no locker.
    pub locker: AdapterConfig,

    /// Audit persistence settings.
    pub audit: AuditConfig,
}

/// Sections the process only reads while starting. Changing one in a
/// reloaded file takes effect after a restart.
pub const STARTUP_ONLY: &[&str] = &[
    "application.server",
    "ssl",
    "logger",
    "metrics",
    "database",
    "cache",
    "queue",
    "locker",
    "audit",
];

impl AppConfig {
    /// Names of the sections that differ between `self` and `next`.
    ///
    /// `application.server` covers the listener and router settings (bind
    /// address, mode, request timeout); `application` covers the rest.
    pub fn changed_sections(&self, next: &AppConfig) -> Vec<&'static str> {
        let (a, b) = (&self.application, &next.application);
        let checks = [
            (
                "application.server",
                a.host != b.host
                    || a.port != b.port
                    || a.mode != b.mode
                    || a.request_timeout_secs != b.request_timeout_secs,
            ),
            (
                "application",
                a.name != b.name || a.shutdown_timeout_secs != b.shutdown_timeout_secs,
            ),
            ("ssl", self.ssl != next.ssl),
            ("logger", self.logger != next.logger),
            ("metrics", self.metrics != next.metrics),
            (
                "database",
                self.database != next.database || self.databases != next.databases,
            ),
            ("cache", self.cache != next.cache),
            ("queue", self.queue != next.queue),
            ("locker", self.locker != next.locker),
            ("audit", self.audit != next.audit),
        ];
        checks
            .into_iter()
            .filter_map(|(section, changed)| changed.then_some(section))
            .collect()
    }
}

/// Run mode of the application.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Dev,
    Test,
    Prod,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Dev => f.write_str("dev"),
            Mode::Test => f.write_str("test"),
            Mode::Prod => f.write_str("prod"),
        }
    }
}

/// Application settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Display name used in the startup banner.
    pub name: String,

    /// Bind host (e.g., "0.0.0.0").
    pub host: String,

    /// Bind port.
    pub port: u16,

    /// Run mode.
    pub mode: Mode,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Graceful shutdown deadline in seconds.
    pub shutdown_timeout_secs: u64,
}

impl ApplicationConfig {
    /// `host:port` string for the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "admin-runtime".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            mode: Mode::Dev,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 5,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct SslConfig {
    /// Serve HTTPS instead of HTTP.
    pub enable: bool,

    /// Path to certificate file (PEM).
    pub cert_file: String,

    /// Path to private key file (PEM).
    pub key_file: String,
}

/// Logger configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggerConfig {
    /// Log level or filter directive (trace, debug, info, warn, error).
    pub level: String,

    /// Output format: "pretty" or "json".
    pub format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus endpoint.
    pub enabled: bool,

    /// Metrics endpoint bind address.
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Database connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Driver name (e.g., "mysql", "postgres", "sqlite3").
    pub driver: String,

    /// Driver-specific connection string.
    pub source: String,

    /// Maximum open connections in the pool.
    pub max_open_conns: u32,

    /// Maximum idle connections in the pool.
    pub max_idle_conns: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: String::new(),
            source: String::new(),
            max_open_conns: 100,
            max_idle_conns: 10,
        }
    }
}

/// Declarative adapter block: a backend discriminator plus free-form options.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct AdapterConfig {
    /// Backend identifier (e.g., "memory").
    #[serde(rename = "type")]
    pub kind: String,

    /// Backend-specific options.
    pub options: Map<String, Value>,
}

impl AdapterConfig {
    /// Create a block for the given backend with no options.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: Map::new(),
        }
    }

    /// Add an option, builder style.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// A block without a `type` is "not configured".
    pub fn is_empty(&self) -> bool {
        self.kind.trim().is_empty()
    }
}

/// Audit persistence configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory for JSON-lines audit files. In-memory store when unset.
    pub dir: Option<String>,
}
