//! Read-through caching in front of the persistence layer.
//!
//! [`MemoryCache`] keeps found values for the positive TTL and authoritative
//! "not found" answers for the (shorter) negative TTL. Concurrent misses for
//! the same key share one lookup: the first caller spawns the fill and every
//! caller, including later arrivals, awaits the same shared result. The fill
//! runs on its own task, so a caller that gives up never stalls the others.
//!
//! Store failures are handed to all waiters and are never cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use moka::Expiry;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::config::Config;
use crate::errors::ApiError;
use crate::models::{Api, Credential, Workspace};
use crate::store::{CredentialStore, ResourceStore};

/// Where a cache goes on a miss.
#[async_trait]
pub trait Source<V>: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<V>, ApiError>;
}

#[async_trait]
pub trait Cache<V>: Send + Sync {
    /// `Ok(None)` means the backing store authoritatively has no such value.
    async fn resolve(&self, key: &str) -> Result<Option<V>, ApiError>;

    /// Drops the entry, and detaches any fill in flight so its result is not
    /// written back. Returns once later `resolve` calls can no longer observe
    /// the old value.
    async fn invalidate(&self, key: &str);
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub negative_ttl: Duration,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_secs(5),
            max_entries: 100_000,
        }
    }
}

impl From<&Config> for CacheConfig {
    fn from(config: &Config) -> Self {
        Self {
            ttl: config.cache_ttl,
            negative_ttl: config.negative_cache_ttl,
            max_entries: config.cache_max_entries,
        }
    }
}

#[derive(Clone)]
enum Cached<V> {
    Found(V),
    Missing,
}

impl<V> Cached<V> {
    fn into_option(self) -> Option<V> {
        match self {
            Cached::Found(value) => Some(value),
            Cached::Missing => None,
        }
    }
}

struct TtlByOutcome {
    positive: Duration,
    negative: Duration,
}

impl TtlByOutcome {
    fn ttl_for<V>(&self, value: &Cached<V>) -> Duration {
        match value {
            Cached::Found(_) => self.positive,
            Cached::Missing => self.negative,
        }
    }
}

impl<V> Expiry<String, Cached<V>> for TtlByOutcome {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Cached<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.ttl_for(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Cached<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.ttl_for(value))
    }
}

type Flight<V> = Shared<BoxFuture<'static, Result<Option<V>, ApiError>>>;

struct InFlight<V: Clone> {
    id: u64,
    flight: Flight<V>,
}

pub struct MemoryCache<V: Clone + Send + Sync + 'static> {
    name: &'static str,
    entries: moka::sync::Cache<String, Cached<V>>,
    inflight: Arc<Mutex<HashMap<String, InFlight<V>>>>,
    next_flight: AtomicU64,
    source: Arc<dyn Source<V>>,
}

impl<V: Clone + Send + Sync + 'static> MemoryCache<V> {
    pub fn new(name: &'static str, config: CacheConfig, source: Arc<dyn Source<V>>) -> Self {
        let entries = moka::sync::Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(TtlByOutcome {
                positive: config.ttl,
                negative: config.negative_ttl,
            })
            .build();

        Self {
            name,
            entries,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_flight: AtomicU64::new(0),
            source,
        }
    }

    // Must be called with the in-flight table locked, and the returned flight
    // registered before the lock is released.
    fn start_fill(&self, key: &str, id: u64) -> Flight<V> {
        let name = self.name;
        let source = self.source.clone();
        let entries = self.entries.clone();
        let guard = FillGuard {
            inflight: self.inflight.clone(),
            key: key.to_string(),
            id,
        };

        let handle = tokio::spawn(async move {
            let result = source.load(&guard.key).await;

            {
                let mut inflight = guard.inflight.lock();
                // An invalidation while we were loading detaches this flight.
                if guard.is_current(&inflight) {
                    inflight.remove(&guard.key);
                    match &result {
                        Ok(Some(value)) => entries.insert(guard.key.clone(), Cached::Found(value.clone())),
                        Ok(None) => entries.insert(guard.key.clone(), Cached::Missing),
                        Err(e) => error!(cache = name, error = %e, "cache fill failed"),
                    }
                }
            }

            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(ApiError::from(e)),
            }
        }
        .boxed()
        .shared()
    }
}

// Unregisters a fill however its task ends, including panics and aborts, so
// later callers start a fresh load instead of joining a dead flight.
struct FillGuard<V: Clone> {
    inflight: Arc<Mutex<HashMap<String, InFlight<V>>>>,
    key: String,
    id: u64,
}

impl<V: Clone> FillGuard<V> {
    fn is_current(&self, inflight: &HashMap<String, InFlight<V>>) -> bool {
        matches!(inflight.get(&self.key), Some(f) if f.id == self.id)
    }
}

impl<V: Clone> Drop for FillGuard<V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        if self.is_current(&inflight) {
            inflight.remove(&self.key);
        }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> Cache<V> for MemoryCache<V> {
    async fn resolve(&self, key: &str) -> Result<Option<V>, ApiError> {
        if let Some(hit) = self.entries.get(key) {
            debug!(cache = self.name, "cache hit");
            return Ok(hit.into_option());
        }

        let flight = {
            let mut inflight = self.inflight.lock();
            // A fill may have landed between the first lookup and the lock.
            if let Some(hit) = self.entries.get(key) {
                return Ok(hit.into_option());
            }
            match inflight.get(key) {
                Some(existing) => {
                    debug!(cache = self.name, "joining in-flight fill");
                    existing.flight.clone()
                }
                None => {
                    debug!(cache = self.name, "cache miss");
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let flight = self.start_fill(key, id);
                    inflight.insert(
                        key.to_string(),
                        InFlight {
                            id,
                            flight: flight.clone(),
                        },
                    );
                    flight
                }
            }
        };

        flight.await
    }

    async fn invalidate(&self, key: &str) {
        let mut inflight = self.inflight.lock();
        inflight.remove(key);
        self.entries.invalidate(key);
    }
}

pub struct KeysByHash(pub Arc<dyn CredentialStore>);

#[async_trait]
impl Source<Credential> for KeysByHash {
    async fn load(&self, hash: &str) -> Result<Option<Credential>, ApiError> {
        self.0.find_by_hash(hash).await
    }
}

pub struct ApisByKeyAuth(pub Arc<dyn ResourceStore>);

#[async_trait]
impl Source<Api> for ApisByKeyAuth {
    async fn load(&self, key_auth_id: &str) -> Result<Option<Api>, ApiError> {
        self.0.find_api_by_key_auth(key_auth_id).await
    }
}

pub struct WorkspacesById(pub Arc<dyn ResourceStore>);

#[async_trait]
impl Source<Workspace> for WorkspacesById {
    async fn load(&self, id: &str) -> Result<Option<Workspace>, ApiError> {
        self.0.find_workspace(id).await
    }
}
