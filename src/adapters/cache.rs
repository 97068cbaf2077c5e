//! Cache capability and its in-memory backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::adapters::{parse_options, AdapterError, Backend, Capability};

/// Errors returned by cache operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("value at {key:?} is not an integer")]
    NotAnInteger { key: String },
    #[error("value at {key:?} has the wrong type for this operation")]
    WrongType { key: String },
    #[error("cache is full ({capacity} entries)")]
    Full { capacity: usize },
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Key/value cache contract.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Backend identifier.
    fn kind(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value; `ttl = None` keeps it until deleted.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;

    async fn hash_set(&self, key: &str, field: &str, value: String) -> Result<(), CacheError>;

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), CacheError>;

    /// Increment an integer value (missing counts as 0) and return the result.
    async fn increase(&self, key: &str) -> Result<i64, CacheError>;

    /// Decrement an integer value (missing counts as 0) and return the result.
    async fn decrease(&self, key: &str) -> Result<i64, CacheError>;

    /// Set a TTL on an existing key. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
}

#[derive(Debug, Clone)]
enum Stored {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Options for the `memory` cache backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryCacheOptions {
    /// Maximum number of keys; 0 means unbounded.
    pub capacity: usize,
}

/// In-process cache backed by a concurrent map. Expiry is checked lazily.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    capacity: usize,
}

impl MemoryCache {
    pub fn new(options: MemoryCacheOptions) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: options.capacity,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| !e.is_expired(now));
    }

    fn ensure_room(&self, key: &str) -> Result<(), CacheError> {
        if self.capacity == 0 || self.entries.contains_key(key) {
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            self.purge_expired();
            if self.entries.len() >= self.capacity {
                return Err(CacheError::Full { capacity: self.capacity });
            }
        }
        Ok(())
    }

    /// Live entry for `key`, removing it if expired.
    fn live(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.ensure_room(key)?;
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = CacheEntry { value: Stored::Text(delta.to_string()), expires_at: None };
                    return Ok(delta);
                }
                let Stored::Text(text) = &entry.value else {
                    return Err(CacheError::WrongType { key: key.to_string() });
                };
                let current: i64 = text
                    .parse()
                    .map_err(|_| CacheError::NotAnInteger { key: key.to_string() })?;
                let next = current + delta;
                entry.value = Stored::Text(next.to_string());
                Ok(next)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(CacheEntry { value: Stored::Text(delta.to_string()), expires_at: None });
                Ok(delta)
            }
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.live(key) {
            Some(CacheEntry { value: Stored::Text(text), .. }) => Ok(Some(text)),
            Some(_) => Err(CacheError::WrongType { key: key.to_string() }),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.ensure_room(key)?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: Stored::Text(value),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        match self.live(key) {
            Some(CacheEntry { value: Stored::Hash(map), .. }) => Ok(map.get(field).cloned()),
            Some(_) => Err(CacheError::WrongType { key: key.to_string() }),
            None => Ok(None),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: String) -> Result<(), CacheError> {
        self.ensure_room(key)?;
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| CacheEntry {
            value: Stored::Hash(HashMap::new()),
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = CacheEntry { value: Stored::Hash(HashMap::new()), expires_at: None };
        }
        match &mut entry.value {
            Stored::Hash(map) => {
                map.insert(field.to_string(), value);
                Ok(())
            }
            Stored::Text(_) => Err(CacheError::WrongType { key: key.to_string() }),
        }
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), CacheError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            match &mut entry.value {
                Stored::Hash(map) => {
                    map.remove(field);
                }
                Stored::Text(_) => return Err(CacheError::WrongType { key: key.to_string() }),
            }
        }
        Ok(())
    }

    async fn increase(&self, key: &str) -> Result<i64, CacheError> {
        self.add(key, 1)
    }

    async fn decrease(&self, key: &str) -> Result<i64, CacheError> {
        self.add(key, -1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Factory entry for `type = "memory"` caches.
pub struct MemoryCacheBackend;

#[async_trait]
impl Backend<dyn Cache> for MemoryCacheBackend {
    async fn connect(&self, _name: &str, options: &Map<String, Value>) -> Result<Arc<dyn Cache>, AdapterError> {
        let options: MemoryCacheOptions = parse_options(Capability::Cache, "memory", options)?;
        Ok(Arc::new(MemoryCache::new(options)))
    }
}
