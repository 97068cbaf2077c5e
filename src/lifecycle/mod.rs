//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Adapters (cache, queue, locker)
//!     → Databases → Audit consumers on the default queue
//!     → Queue run loops → Routes → API self-check → Bind listener
//!
//! Shutdown (shutdown.rs):
//!     Interrupt → Stop accepting → Drain requests (bounded deadline)
//!     → Queues drain → Exit
//!
//! Signals (signals.rs):
//!     SIGINT/SIGTERM → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then adapters, then consumers, then listener
//! - Fail fast: any startup error is fatal and names the failing piece
//! - Shutdown has a deadline: in-flight requests still running after it are
//!   abandoned and reported as a timeout

pub mod shutdown;
pub mod signals;
pub mod startup;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::adapters::{AdapterError, Capability};
use crate::audit::AuditError;
use crate::config::ConfigError;
use crate::observability::logging::LoggingError;
use crate::queue::QueueError;
use crate::runtime::RuntimeError;

pub use shutdown::Shutdown;
pub use startup::{install_adapters, Orchestrator, Running};

/// Errors that stop the process from starting or shutting down cleanly.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{capability} adapter setup failed: {source}")]
    Adapter {
        capability: Capability,
        #[source]
        source: AdapterError,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("audit store setup failed: {0}")]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load TLS certificate: {0}")]
    Tls(#[source] std::io::Error),

    #[error("HTTP server error: {0}")]
    Server(#[source] std::io::Error),

    #[error("in-flight requests did not finish within {deadline:?}")]
    ShutdownTimeout { deadline: Duration },

    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },
}

impl LifecycleError {
    /// True for errors caused by the configuration rather than the environment.
    pub fn is_config_error(&self) -> bool {
        match self {
            LifecycleError::Config(_) => true,
            LifecycleError::Adapter { source, .. } => source.is_config_error(),
            _ => false,
        }
    }
}

/// Process phases, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    Unconfigured = 0,
    ConfigLoaded = 1,
    AdaptersReady = 2,
    ConsumersRegistered = 3,
    Serving = 4,
    Draining = 5,
    Stopped = 6,
}

impl From<u8> for Phase {
    fn from(v: u8) -> Self {
        match v {
            0 => Phase::Unconfigured,
            1 => Phase::ConfigLoaded,
            2 => Phase::AdaptersReady,
            3 => Phase::ConsumersRegistered,
            4 => Phase::Serving,
            5 => Phase::Draining,
            _ => Phase::Stopped,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unconfigured => "unconfigured",
            Phase::ConfigLoaded => "config-loaded",
            Phase::AdaptersReady => "adapters-ready",
            Phase::ConsumersRegistered => "consumers-registered",
            Phase::Serving => "serving",
            Phase::Draining => "draining",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Tracks the current phase. Phases only move forward one step at a time;
/// `Stopped` can be entered from anywhere.
#[derive(Debug)]
pub struct Lifecycle {
    phase: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Unconfigured as u8),
        }
    }

    /// A lifecycle whose configuration is already loaded and validated.
    pub fn configured() -> Self {
        Self {
            phase: AtomicU8::new(Phase::ConfigLoaded as u8),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from(self.phase.load(Ordering::Acquire))
    }

    pub fn advance(&self, to: Phase) -> Result<(), LifecycleError> {
        let from = self.phase();
        let allowed = to == Phase::Stopped || to as u8 == from as u8 + 1;
        if !allowed {
            return Err(LifecycleError::InvalidTransition { from, to });
        }
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| LifecycleError::InvalidTransition {
                from: Phase::from(actual),
                to,
            })?;
        tracing::debug!(from = %from, to = %to, "Lifecycle phase changed");
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
