use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::FailurePolicy;
use crate::errors::ApiError;
use crate::models::{RateLimitConfig, RateLimitDecision, RateLimitMode};

const MAX_CAS_ATTEMPTS: usize = 1000;

/// One token bucket. Tokens are whole numbers; time since `last_refill_ms`
/// that does not add up to a full interval is not credited yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens: u64,
    pub last_refill_ms: i64,
}

impl BucketState {
    pub fn full(config: &RateLimitConfig, now_ms: i64) -> Self {
        Self {
            tokens: config.limit,
            last_refill_ms: now_ms,
        }
    }

    pub fn refilled(&self, config: &RateLimitConfig, now_ms: i64) -> Self {
        let interval = interval_ms(config);
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        let intervals = if elapsed > 0 { elapsed / interval } else { 0 };

        Self {
            tokens: self
                .tokens
                .saturating_add((intervals as u64).saturating_mul(config.refill_rate))
                .min(config.limit),
            last_refill_ms: self
                .last_refill_ms
                .saturating_add(intervals.saturating_mul(interval)),
        }
    }

    pub fn next_refill_ms(&self, config: &RateLimitConfig) -> i64 {
        self.last_refill_ms.saturating_add(interval_ms(config))
    }
}

fn interval_ms(config: &RateLimitConfig) -> i64 {
    i64::try_from(config.refill_interval_ms)
        .unwrap_or(i64::MAX)
        .max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub admitted: bool,
    pub next: BucketState,
}

/// Refills `current` (or a full bucket if there is none) up to `now_ms` and
/// takes one token if there is one.
pub fn evaluate(current: Option<BucketState>, config: &RateLimitConfig, now_ms: i64) -> Evaluation {
    let refilled = match current {
        Some(state) => state.refilled(config, now_ms),
        None => BucketState::full(config, now_ms),
    };

    if refilled.tokens > 0 {
        Evaluation {
            admitted: true,
            next: BucketState {
                tokens: refilled.tokens - 1,
                ..refilled
            },
        }
    } else {
        Evaluation {
            admitted: false,
            next: refilled,
        }
    }
}

fn decision(evaluation: &Evaluation, config: &RateLimitConfig) -> RateLimitDecision {
    RateLimitDecision {
        admitted: evaluation.admitted,
        limit: Some(config.limit),
        remaining: Some(evaluation.next.tokens),
        reset_at: Utc
            .timestamp_millis_opt(evaluation.next.next_refill_ms(config))
            .single(),
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(
        &self,
        key_id: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, ApiError>;
}

/// Buckets in local memory, one lock per key. Each process enforces its own
/// limit, so a fleet of N instances admits up to N times the configured rate.
pub struct FastRateLimiter {
    buckets: moka::sync::Cache<String, Arc<Mutex<BucketState>>>,
}

impl FastRateLimiter {
    pub fn new(idle: Duration) -> Self {
        Self {
            buckets: moka::sync::Cache::builder().time_to_idle(idle).build(),
        }
    }
}

#[async_trait]
impl RateLimiter for FastRateLimiter {
    async fn allow(
        &self,
        key_id: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, ApiError> {
        let now_ms = now.timestamp_millis();
        let bucket = self.buckets.get_with(key_id.to_string(), || {
            Arc::new(Mutex::new(BucketState::full(config, now_ms)))
        });

        let evaluation = {
            let mut state = bucket.lock();
            let evaluation = evaluate(Some(*state), config, now_ms);
            *state = evaluation.next;
            evaluation
        };

        Ok(decision(&evaluation, config))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub state: BucketState,
}

/// Shared bucket storage that every instance contends on.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, ApiError>;

    /// Stores `state` only if the stored version is still `expected`
    /// (`None`: no bucket stored yet). Returns whether the write was applied.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: BucketState,
    ) -> Result<bool, ApiError>;
}

/// Counter store for a single process. Buckets idle longer than `idle` are
/// dropped and start over full.
pub struct MemoryCounterStore {
    slots: moka::sync::Cache<String, Arc<Mutex<Option<Versioned>>>>,
}

impl MemoryCounterStore {
    pub fn new(idle: Duration) -> Self {
        Self {
            slots: moka::sync::Cache::builder().time_to_idle(idle).build(),
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, ApiError> {
        Ok(self.slots.get(key).and_then(|slot| {
            let stored = *slot.lock();
            stored
        }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: BucketState,
    ) -> Result<bool, ApiError> {
        let slot = self
            .slots
            .get_with(key.to_string(), || Arc::new(Mutex::new(None)));
        let mut stored = slot.lock();

        if (*stored).map(|v| v.version) != expected {
            return Ok(false);
        }
        *stored = Some(Versioned {
            version: expected.map_or(1, |v| v + 1),
            state,
        });
        Ok(true)
    }
}

/// Exact limits across instances: read, compute, compare-and-swap, retry on
/// conflict. Rejections write nothing.
pub struct ConsistentRateLimiter {
    store: Arc<dyn CounterStore>,
}

impl ConsistentRateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RateLimiter for ConsistentRateLimiter {
    async fn allow(
        &self,
        key_id: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, ApiError> {
        let now_ms = now.timestamp_millis();

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.load(key_id).await?;
            let evaluation = evaluate(current.map(|v| v.state), config, now_ms);

            if !evaluation.admitted {
                return Ok(decision(&evaluation, config));
            }

            let expected = current.map(|v| v.version);
            if self
                .store
                .compare_and_swap(key_id, expected, evaluation.next)
                .await?
            {
                return Ok(decision(&evaluation, config));
            }

            debug!(key_id, attempt, "rate limit bucket changed underneath us, retrying");
            tokio::task::yield_now().await;
        }

        Err(ApiError::RateLimiter(format!(
            "gave up after {} conflicting updates",
            MAX_CAS_ATTEMPTS
        )))
    }
}

/// Picks the limiter for a key's configured mode and applies the failure policy.
pub struct RateLimitManager {
    fast: Arc<dyn RateLimiter>,
    consistent: Arc<dyn RateLimiter>,
    failure_policy: FailurePolicy,
}

impl RateLimitManager {
    pub fn new(
        fast: Arc<dyn RateLimiter>,
        consistent: Arc<dyn RateLimiter>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            fast,
            consistent,
            failure_policy,
        }
    }

    pub fn in_memory(idle: Duration, failure_policy: FailurePolicy) -> Self {
        Self::new(
            Arc::new(FastRateLimiter::new(idle)),
            Arc::new(ConsistentRateLimiter::new(Arc::new(MemoryCounterStore::new(
                idle,
            )))),
            failure_policy,
        )
    }

    pub fn get_limiter(&self, mode: RateLimitMode) -> Arc<dyn RateLimiter> {
        match mode {
            RateLimitMode::Fast => self.fast.clone(),
            RateLimitMode::Consistent => self.consistent.clone(),
        }
    }

    /// Keys without a rate limit are always admitted.
    pub async fn allow(
        &self,
        key_id: &str,
        config: Option<&RateLimitConfig>,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, ApiError> {
        let Some(config) = config else {
            return Ok(RateLimitDecision::unlimited());
        };
        config
            .validate()
            .map_err(|e| ApiError::RateLimiter(format!("key {}: {}", key_id, e)))?;

        match self.get_limiter(config.mode).allow(key_id, config, now).await {
            Ok(decision) => Ok(decision),
            Err(e) if self.failure_policy == FailurePolicy::Open => {
                warn!(key_id, error = %e, "rate limiter unavailable, admitting request");
                Ok(RateLimitDecision {
                    admitted: true,
                    limit: Some(config.limit),
                    remaining: None,
                    reset_at: None,
                })
            }
            Err(e) => {
                error!(key_id, error = %e, "rate limiter unavailable");
                Err(e)
            }
        }
    }
}
