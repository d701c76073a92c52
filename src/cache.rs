use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Result, YieldError};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Build a cache key from its parts, e.g. `aggregator:opportunities:USDC:1`
pub fn cache_key(parts: &[&str]) -> String {
    parts.join(":")
}

#[derive(Clone)]
struct CacheEntry {
    data: Arc<dyn Any + Send + Sync>,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

/// Each entry lives for the TTL it was stored with; a re-set restarts the clock
struct EntryTtl;

impl Expiry<String, CacheEntry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, value: &CacheEntry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub keys: Vec<String>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Concurrent TTL store shared by adapters, aggregator and optimizer.
///
/// Values are type-erased; `get::<T>` returns `None` on a miss, on expiry
/// and when the stored type differs from `T`. Expired entries are invisible
/// to reads at once and physically dropped by `cleanup`.
///
/// Concurrent misses on one key each run their own factory in `get_or_set`;
/// there is no request coalescing.
pub struct TtlCache {
    entries: Cache<String, CacheEntry>,
    expired: Arc<AtomicUsize>,
    default_ttl: Duration,
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl TtlCache {
    pub fn new(default_ttl: Duration) -> Self {
        let expired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&expired);
        let entries = Cache::builder()
            .expire_after(EntryTtl)
            .eviction_listener(move |_key, _value, cause| {
                if cause == RemovalCause::Expired {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();
        Self { entries, expired, default_ttl }
    }

    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self.entries.get(key).await?;
        entry.data.downcast_ref::<T>().cloned()
    }

    pub async fn set<T>(&self, key: impl Into<String>, value: T, ttl: Option<Duration>)
    where
        T: Send + Sync + 'static,
    {
        let entry = CacheEntry {
            data: Arc::new(value),
            stored_at: Utc::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.entries.insert(key.into(), entry).await;
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).await.is_some()
    }

    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(key, _)| key.as_ref().clone()).collect()
    }

    /// Drop every expired entry, returning how many expired since the last cleanup
    pub async fn cleanup(&self) -> usize {
        self.entries.run_pending_tasks().await;
        self.expired.swap(0, Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        let mut keys = Vec::new();
        let mut oldest_entry: Option<DateTime<Utc>> = None;
        let mut newest_entry: Option<DateTime<Utc>> = None;
        for (key, entry) in self.entries.iter() {
            keys.push(key.as_ref().clone());
            oldest_entry = Some(oldest_entry.map_or(entry.stored_at, |t| t.min(entry.stored_at)));
            newest_entry = Some(newest_entry.map_or(entry.stored_at, |t| t.max(entry.stored_at)));
        }
        CacheStats { size: keys.len(), keys, oldest_entry, newest_entry }
    }

    /// Cached value for `key`, or run `factory`, store and return its output.
    /// A factory failure becomes a `YieldError::Cache` for the key.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, factory: F, ttl: Option<Duration>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(hit);
        }
        let value = factory().await.map_err(|e| YieldError::Cache {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Start the periodic sweep. The task runs until the returned handle is shut down.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cache = Arc::clone(self);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.cleanup().await;
                        if removed > 0 {
                            debug!(removed, remaining = cache.len(), "Cache sweep");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Cache sweeper stopped");
        });

        SweeperHandle { shutdown_tx, join }
    }
}

pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}
