//! Captcha answers stored in the cache adapter.

use std::sync::Arc;
use std::time::Duration;

use crate::adapters::{Cache, CacheError};

/// How long a captcha answer stays valid.
pub const CAPTCHA_TTL: Duration = Duration::from_secs(600);

const KEY_PREFIX: &str = "captcha:";

/// Captcha store backed by whichever cache adapter is active.
#[derive(Clone)]
pub struct CacheCaptchaStore {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl CacheCaptchaStore {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub async fn set(&self, id: &str, answer: &str) -> Result<(), CacheError> {
        self.cache
            .set(&format!("{KEY_PREFIX}{id}"), answer.to_string(), Some(self.ttl))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<String>, CacheError> {
        self.cache.get(&format!("{KEY_PREFIX}{id}")).await
    }

    /// Compare `answer` case-insensitively; `clear` removes the entry either way.
    pub async fn verify(&self, id: &str, answer: &str, clear: bool) -> Result<bool, CacheError> {
        let key = format!("{KEY_PREFIX}{id}");
        let stored = self.cache.get(&key).await?;
        if clear {
            self.cache.del(&key).await?;
        }
        Ok(stored.is_some_and(|s| s.eq_ignore_ascii_case(answer)))
    }
}
