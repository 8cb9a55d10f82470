//! Look-aside cache abstraction.
//!
//! A key → blob store with per-entry TTL. A miss is `Ok(None)`; only genuine
//! faults are errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::Context;
use crate::error::{Error, Result};

/// Cache trait.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Reads an entry. Returns `Ok(None)` on a miss or an expired entry.
    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<Bytes>>;

    /// Writes an entry that expires after `ttl`.
    async fn set(&self, ctx: &Context, key: &str, value: Bytes, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// In-memory cache for tests and single-process embedding.
///
/// Expired entries are dropped lazily on read. [`MemoryCache::set_failing`]
/// turns every call into a [`Error::Cache`] fault.
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the number of live entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let now = Instant::now();
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.values().filter(|e| e.expires_at > now).count())
    }

    /// Returns true if the cache holds no live entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    fn check_failing(&self, op: &str, key: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::cache(format!("injected {op} failure for {key}")));
        }
        Ok(())
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "cache lock poisoned".into(),
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, _ctx: &Context, key: &str) -> Result<Option<Bytes>> {
        self.check_failing("get", key)?;
        let now = Instant::now();
        let found = self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .get(key)
            .map(|entry| (entry.expires_at > now, entry.value.clone()));
        match found {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.entries.write().map_err(|_| poisoned())?.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, _ctx: &Context, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.check_failing("set", key)?;
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_and_miss() {
        let cache = MemoryCache::new();
        let ctx = Context::new("test");
        assert!(cache.get(&ctx, "k").await.unwrap().is_none());

        cache
            .set(&ctx, "k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get(&ctx, "k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = MemoryCache::new();
        let ctx = Context::new("test");
        cache
            .set(&ctx, "k", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        assert!(cache.get(&ctx, "k").await.unwrap().is_none());
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn injected_failures_are_errors_not_misses() {
        let cache = MemoryCache::new();
        let ctx = Context::new("test");
        cache.set_failing(true);
        assert!(matches!(
            cache.get(&ctx, "k").await,
            Err(Error::Cache { .. })
        ));
        cache.set_failing(false);
        assert!(cache.get(&ctx, "k").await.unwrap().is_none());
    }
}
