//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → AppConfig (validated, immutable)
//!     → held by the Runtime in an ArcSwap
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → watcher.rs drops it if no section changed
//!     → atomic swap inside the Runtime (startup-only sections reported)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Adapter blocks are only read at startup; a reload never swaps adapters

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdapterConfig, AppConfig, ApplicationConfig, AuditConfig, DatabaseConfig, LoggerConfig,
    MetricsConfig, Mode, SslConfig, STARTUP_ONLY,
};
