//! Distributed lock capability and its in-memory backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::adapters::{parse_options, AdapterError, Backend, Capability};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock {key:?} is held by another owner")]
    Held { key: String },
    #[error("lock {key:?} is not held by this lease")]
    NotHeld { key: String },
    #[error("locker backend error: {0}")]
    Backend(String),
}

/// Proof of ownership of a lock. Only the holder's token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: String,
    token: Uuid,
}

impl Lease {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> Uuid {
        self.token
    }
}

/// Distributed lock contract.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Backend identifier.
    fn kind(&self) -> &str;

    /// Acquire `key` for `ttl`. Fails with [`LockError::Held`] while another
    /// unexpired lease exists.
    async fn lock(&self, key: &str, ttl: Duration) -> Result<Lease, LockError>;

    async fn release(&self, lease: &Lease) -> Result<(), LockError>;

    /// Extend the lease to `ttl` from now.
    async fn refresh(&self, lease: &Lease, ttl: Duration) -> Result<(), LockError>;
}

#[derive(Debug)]
struct Held {
    token: Uuid,
    expires_at: Instant,
}

/// Options for the `memory` locker backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryLockerOptions {}

/// Process-local locker. Leases expire on their own after the TTL.
#[derive(Debug, Default)]
pub struct MemoryLocker {
    locks: DashMap<String, Held>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn lock(&self, key: &str, ttl: Duration) -> Result<Lease, LockError> {
        let now = Instant::now();
        let lease = Lease::new(key);
        let held = Held { token: lease.token, expires_at: now + ttl };

        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Err(LockError::Held { key: key.to_string() });
                }
                occupied.insert(held);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(held);
            }
        }
        tracing::debug!(key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        Ok(lease)
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        self.locks
            .remove_if(&lease.key, |_, held| held.token == lease.token)
            .map(|_| ())
            .ok_or_else(|| LockError::NotHeld { key: lease.key.clone() })
    }

    async fn refresh(&self, lease: &Lease, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        match self.locks.get_mut(&lease.key) {
            Some(mut held) if held.token == lease.token && held.expires_at > now => {
                held.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(LockError::NotHeld { key: lease.key.clone() }),
        }
    }
}

/// Factory entry for `type = "memory"` lockers.
pub struct MemoryLockerBackend;

#[async_trait]
impl Backend<dyn Locker> for MemoryLockerBackend {
    async fn connect(&self, _name: &str, options: &Map<String, Value>) -> Result<Arc<dyn Locker>, AdapterError> {
        let _: MemoryLockerOptions = parse_options(Capability::Locker, "memory", options)?;
        Ok(Arc::new(MemoryLocker::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_until_release() {
        let locker = MemoryLocker::new();
        let lease = locker.lock("job:sync", Duration::from_secs(10)).await.unwrap();

        assert_eq!(
            locker.lock("job:sync", Duration::from_secs(10)).await,
            Err(LockError::Held { key: "job:sync".into() })
        );

        locker.release(&lease).await.unwrap();
        assert!(locker.lock("job:sync", Duration::from_secs(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let locker = MemoryLocker::new();
        let stale = locker.lock("k", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let fresh = locker.lock("k", Duration::from_secs(10)).await.unwrap();
        assert_ne!(stale.token(), fresh.token());

        // The stale holder can neither refresh nor release the new lease.
        assert!(locker.refresh(&stale, Duration::from_secs(1)).await.is_err());
        assert_eq!(locker.release(&stale).await, Err(LockError::NotHeld { key: "k".into() }));
        assert!(locker.release(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_extends() {
        let locker = MemoryLocker::new();
        let lease = locker.lock("k", Duration::from_millis(30)).await.unwrap();
        locker.refresh(&lease, Duration::from_secs(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            locker.lock("k", Duration::from_secs(1)).await,
            Err(LockError::Held { .. })
        ));
    }
}
