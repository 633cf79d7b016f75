//! The per-request decision pipeline.
//!
//! A key is checked in a fixed order, stopping at the first failure:
//! lookup, revocation, expiry, owning API / workspace, source IP, rate limit,
//! and finally the usage quota. The rate limit runs before the quota so a
//! throttled request never costs the key one of its remaining uses.
//!
//! A request deadline only bounds the read-only checks. Rate limiting and the
//! quota decrement both write, so once they start they run to completion.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::cache::{ApisByKeyAuth, Cache, CacheConfig, KeysByHash, MemoryCache, WorkspacesById};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::errors::ApiError;
use crate::events::{Event, EventKind, EventSink};
use crate::models::{Api, Credential, ReasonCode, VerificationResult, VerifyKeyRequest, Workspace};
use crate::quota::{QuotaOutcome, QuotaTracker};
use crate::rate_limit::RateLimitManager;
use crate::security::hash_key;
use crate::store::{CredentialStore, ResourceStore};

enum Checked {
    Denied(VerificationResult),
    Passed(Credential),
}

pub struct VerificationEngine {
    keys: Arc<dyn Cache<Credential>>,
    apis: Arc<dyn Cache<Api>>,
    workspaces: Arc<dyn Cache<Workspace>>,
    store: Arc<dyn CredentialStore>,
    rate_limits: RateLimitManager,
    quota: QuotaTracker,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

pub struct EngineBuilder {
    credentials: Arc<dyn CredentialStore>,
    resources: Arc<dyn ResourceStore>,
    events: Arc<dyn EventSink>,
    cache_config: CacheConfig,
    key_cache: Option<Arc<dyn Cache<Credential>>>,
    rate_limits: Option<RateLimitManager>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn cache_config(mut self, cache_config: CacheConfig) -> Self {
        self.cache_config = cache_config;
        self
    }

    /// Replaces the in-memory verification cache, e.g. with a shared one.
    pub fn key_cache(mut self, key_cache: Arc<dyn Cache<Credential>>) -> Self {
        self.key_cache = Some(key_cache);
        self
    }

    pub fn rate_limits(mut self, rate_limits: RateLimitManager) -> Self {
        self.rate_limits = Some(rate_limits);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> VerificationEngine {
        let cache_config = self.cache_config;
        let keys = self.key_cache.unwrap_or_else(|| {
            Arc::new(MemoryCache::new(
                "keys_by_hash",
                cache_config,
                Arc::new(KeysByHash(self.credentials.clone())),
            ))
        });

        VerificationEngine {
            keys,
            apis: Arc::new(MemoryCache::new(
                "apis_by_key_auth",
                cache_config,
                Arc::new(ApisByKeyAuth(self.resources.clone())),
            )),
            workspaces: Arc::new(MemoryCache::new(
                "workspaces",
                cache_config,
                Arc::new(WorkspacesById(self.resources.clone())),
            )),
            store: self.credentials.clone(),
            rate_limits: self.rate_limits.unwrap_or_else(|| {
                let defaults = Config::default();
                RateLimitManager::in_memory(defaults.rate_limit_idle, defaults.rate_limit_failure_policy)
            }),
            quota: QuotaTracker::new(self.credentials),
            events: self.events,
            clock: self.clock,
        }
    }
}

impl VerificationEngine {
    pub fn builder(
        credentials: Arc<dyn CredentialStore>,
        resources: Arc<dyn ResourceStore>,
        events: Arc<dyn EventSink>,
    ) -> EngineBuilder {
        EngineBuilder {
            credentials,
            resources,
            events,
            cache_config: CacheConfig::default(),
            key_cache: None,
            rate_limits: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Engine over one store backing both keys and resources.
    pub fn from_config<S>(store: Arc<S>, events: Arc<dyn EventSink>, config: &Config) -> EngineBuilder
    where
        S: CredentialStore + ResourceStore + 'static,
    {
        Self::builder(store.clone(), store, events)
            .cache_config(CacheConfig::from(config))
            .rate_limits(RateLimitManager::in_memory(
                config.rate_limit_idle,
                config.rate_limit_failure_policy,
            ))
    }

    /// Domain outcomes come back as `Ok` with a reason code. `Err` means the
    /// decision could not be made: backend trouble, or the request's timeout
    /// ran out before the rate limit step (in which case nothing was written).
    pub async fn verify(&self, request: &VerifyKeyRequest) -> Result<VerificationResult, ApiError> {
        let deadline = request
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        let checked = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.check(request))
                .await
                .map_err(|_| ApiError::Cancelled)??,
            None => self.check(request).await?,
        };

        let key = match checked {
            Checked::Denied(result) => {
                self.record(&result, request);
                return Ok(result);
            }
            Checked::Passed(key) => key,
        };

        // Last chance to back out. From here on tokens and uses are spent.
        if matches!(deadline, Some(deadline) if Instant::now() >= deadline) {
            return Err(ApiError::Cancelled);
        }

        let rate_limit = self
            .rate_limits
            .allow(&key.id, key.rate_limit.as_ref(), self.clock.now())
            .await?;
        if !rate_limit.admitted {
            let mut result = VerificationResult::for_key(&key, ReasonCode::RateLimited);
            result.rate_limit = Some(rate_limit);
            self.record(&result, request);
            return Ok(result);
        }

        let mut result = match self.quota.consume(&key.id, key.remaining).await {
            Ok(QuotaOutcome::Unlimited) => VerificationResult::for_key(&key, ReasonCode::Valid),
            Ok(QuotaOutcome::Consumed { remaining }) => {
                // The cached copy carries the old count.
                self.keys.invalidate(&key.hash).await;
                VerificationResult {
                    remaining: Some(remaining),
                    ..VerificationResult::for_key(&key, ReasonCode::Valid)
                }
            }
            Ok(QuotaOutcome::Exhausted) => VerificationResult {
                remaining: Some(0),
                ..VerificationResult::for_key(&key, ReasonCode::QuotaExhausted)
            },
            Err(e) => {
                error!(key_id = %key.id, error = %e, "quota update failed");
                return Err(e);
            }
        };
        result.rate_limit = Some(rate_limit);

        self.record(&result, request);
        Ok(result)
    }

    async fn check(&self, request: &VerifyKeyRequest) -> Result<Checked, ApiError> {
        let now = self.clock.now();
        let hash = hash_key(&request.key);

        let key = match self.keys.resolve(&hash).await {
            Ok(Some(key)) => key,
            Ok(None) => return Ok(Checked::Denied(VerificationResult::not_found())),
            Err(e) => {
                error!(error = %e, "key lookup failed");
                return Err(e);
            }
        };

        if key.is_deleted() {
            return Ok(Checked::Denied(VerificationResult::for_key(&key, ReasonCode::Revoked)));
        }
        if key.is_expired(now) {
            return Ok(Checked::Denied(VerificationResult::for_key(&key, ReasonCode::Expired)));
        }
        if let Some(code) = self.gate(&key, request.source_ip.as_deref()).await? {
            return Ok(Checked::Denied(VerificationResult::for_key(&key, code)));
        }

        Ok(Checked::Passed(key))
    }

    // The owning API must be live and still use key auth, its workspace must be
    // enabled, and the caller's address must pass the API's allow-list.
    async fn gate(&self, key: &Credential, source_ip: Option<&str>) -> Result<Option<ReasonCode>, ApiError> {
        let api = match self.apis.resolve(&key.key_auth_id).await? {
            Some(api)
                if api.deleted_at.is_none()
                    && api.workspace_id == key.workspace_id
                    && api.auth.key_auth_id() == Some(key.key_auth_id.as_str()) =>
            {
                api
            }
            _ => return Ok(Some(ReasonCode::Disabled)),
        };

        match self.workspaces.resolve(&key.workspace_id).await? {
            Some(workspace) if workspace.enabled => {}
            _ => return Ok(Some(ReasonCode::Disabled)),
        }

        if !api.allows_ip(source_ip) {
            return Ok(Some(ReasonCode::Forbidden));
        }
        Ok(None)
    }

    fn record(&self, result: &VerificationResult, request: &VerifyKeyRequest) {
        debug!(code = result.code.as_str(), key_id = ?result.key_id, "key verified");

        if let (Some(key_id), Some(workspace_id)) = (&result.key_id, &result.workspace_id) {
            self.events.emit(Event {
                kind: EventKind::KeyVerified { code: result.code },
                key_id: key_id.clone(),
                workspace_id: workspace_id.clone(),
                source_ip: request.source_ip.clone(),
                time: self.clock.now(),
            });
        }
    }

    /// Permanently revokes a key. The very next verification sees the
    /// revocation, even if the key was cached.
    pub async fn revoke(&self, workspace_id: &str, key_id: &str) -> Result<(), ApiError> {
        let key = self.live_key(workspace_id, key_id).await?;

        // Someone else deleted it first.
        if !self.store.soft_delete(&key.id, self.clock.now()).await? {
            return Err(ApiError::KeyNotFound);
        }
        self.keys.invalidate(&key.hash).await;

        info!(key_id, workspace_id, "key revoked");
        self.events.emit(Event {
            kind: EventKind::KeyRevoked,
            key_id: key.id,
            workspace_id: key.workspace_id,
            source_ip: None,
            time: self.clock.now(),
        });
        Ok(())
    }

    /// Overwrites a key's remaining uses; `None` removes the limit.
    pub async fn update_remaining(
        &self,
        workspace_id: &str,
        key_id: &str,
        remaining: Option<u64>,
    ) -> Result<(), ApiError> {
        let key = self.live_key(workspace_id, key_id).await?;

        if !self.store.set_remaining(&key.id, remaining).await? {
            return Err(ApiError::KeyNotFound);
        }
        self.keys.invalidate(&key.hash).await;

        info!(key_id, workspace_id, ?remaining, "remaining uses updated");
        Ok(())
    }

    pub async fn invalidate_api(&self, key_auth_id: &str) {
        self.apis.invalidate(key_auth_id).await;
    }

    pub async fn invalidate_workspace(&self, workspace_id: &str) {
        self.workspaces.invalidate(workspace_id).await;
    }

    // Authoritative read, bypassing the cache. Keys of other workspaces are
    // indistinguishable from missing ones.
    async fn live_key(&self, workspace_id: &str, key_id: &str) -> Result<Credential, ApiError> {
        match self.store.find_by_id(key_id).await? {
            Some(key) if key.workspace_id == workspace_id && !key.is_deleted() => Ok(key),
            _ => Err(ApiError::KeyNotFound),
        }
    }
}
