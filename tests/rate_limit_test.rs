use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use key_verifier::{
    config::FailurePolicy,
    database::Database,
    errors::ApiError,
    models::RateLimitConfig,
    rate_limit::{
        evaluate, BucketState, ConsistentRateLimiter, CounterStore, FastRateLimiter,
        MemoryCounterStore, RateLimitManager, RateLimiter, Versioned,
    },
};

const IDLE: Duration = Duration::from_secs(60);

fn start() -> DateTime<Utc> {
    Utc::now()
}

async fn admitted_count(
    limiter: &dyn RateLimiter,
    key: &str,
    config: &RateLimitConfig,
    now: DateTime<Utc>,
    attempts: usize,
) -> usize {
    let mut admitted = 0;
    for _ in 0..attempts {
        if limiter.allow(key, config, now).await.unwrap().admitted {
            admitted += 1;
        }
    }
    admitted
}

fn limiters() -> Vec<(&'static str, Arc<dyn RateLimiter>)> {
    vec![
        ("fast", Arc::new(FastRateLimiter::new(IDLE))),
        (
            "consistent",
            Arc::new(ConsistentRateLimiter::new(Arc::new(MemoryCounterStore::new(IDLE)))),
        ),
    ]
}

#[tokio::test]
async fn test_burst_is_capped_at_limit() {
    let now = start();
    for (name, limiter) in limiters() {
        let config = RateLimitConfig::fast(5, 1, 1000);

        let first = limiter.allow("key_burst", &config, now).await.unwrap();
        assert!(first.admitted, "{}", name);
        assert_eq!(first.limit, Some(5));
        assert_eq!(first.remaining, Some(4));

        let admitted = admitted_count(limiter.as_ref(), "key_burst", &config, now, 20).await;
        assert_eq!(admitted, 4, "{}", name);

        let rejected = limiter.allow("key_burst", &config, now).await.unwrap();
        assert!(!rejected.admitted, "{}", name);
        assert_eq!(rejected.remaining, Some(0));
    }
}

#[tokio::test]
async fn test_one_interval_refills_exactly_refill_rate() {
    let now = start();
    for (name, limiter) in limiters() {
        let config = RateLimitConfig::fast(10, 3, 1000);
        assert_eq!(admitted_count(limiter.as_ref(), "key_refill", &config, now, 15).await, 10);

        // Just short of one interval nothing comes back
        let almost = now + ChronoDuration::milliseconds(999);
        assert_eq!(admitted_count(limiter.as_ref(), "key_refill", &config, almost, 5).await, 0, "{}", name);

        let later = now + ChronoDuration::milliseconds(1000);
        assert_eq!(admitted_count(limiter.as_ref(), "key_refill", &config, later, 10).await, 3, "{}", name);
    }
}

#[tokio::test]
async fn test_refill_is_capped_at_limit() {
    let now = start();
    for (name, limiter) in limiters() {
        let config = RateLimitConfig::fast(5, 3, 100);
        assert_eq!(admitted_count(limiter.as_ref(), "key_cap", &config, now, 5).await, 5);

        let much_later = now + ChronoDuration::seconds(60);
        assert_eq!(
            admitted_count(limiter.as_ref(), "key_cap", &config, much_later, 20).await,
            5,
            "{}",
            name
        );
    }
}

#[tokio::test]
async fn test_partial_intervals_are_not_credited() {
    let config = RateLimitConfig::fast(10, 2, 1000);
    let drained = BucketState {
        tokens: 0,
        last_refill_ms: 0,
    };

    // 1.5 intervals: one refill, the half interval stays banked
    let state = drained.refilled(&config, 1500);
    assert_eq!(state.tokens, 2);
    assert_eq!(state.last_refill_ms, 1000);

    let state = state.refilled(&config, 1999);
    assert_eq!(state.tokens, 2);

    let state = state.refilled(&config, 2000);
    assert_eq!(state.tokens, 4);
    assert_eq!(state.next_refill_ms(&config), 3000);
}

#[tokio::test]
async fn test_rejection_leaves_bucket_untouched() {
    let config = RateLimitConfig::fast(1, 1, 1000);
    let empty = BucketState {
        tokens: 0,
        last_refill_ms: 10_000,
    };

    let evaluation = evaluate(Some(empty), &config, 10_500);
    assert!(!evaluation.admitted);
    assert_eq!(evaluation.next, empty);

    let fresh = evaluate(None, &config, 10_500);
    assert!(fresh.admitted);
    assert_eq!(fresh.next.tokens, 0);
}

#[tokio::test]
async fn test_clock_going_backwards_does_not_refill() {
    let config = RateLimitConfig::fast(3, 3, 1000);
    let state = BucketState {
        tokens: 0,
        last_refill_ms: 5_000,
    };
    assert_eq!(state.refilled(&config, 1_000), state);
}

#[tokio::test]
async fn test_reset_at_is_next_refill() {
    let now = start();
    let limiter = FastRateLimiter::new(IDLE);
    let config = RateLimitConfig::fast(2, 1, 30_000);

    let decision = limiter.allow("key_reset", &config, now).await.unwrap();
    let reset_at = decision.reset_at.expect("reset time");
    assert_eq!(
        reset_at.timestamp_millis(),
        now.timestamp_millis() + 30_000
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_burst_admits_at_most_limit() {
    let now = start();
    for (name, limiter) in limiters() {
        let config = RateLimitConfig::fast(10, 1, 60_000);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                limiter.allow("key_hot", &config, now).await.unwrap().admitted
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10, "{}", name);
    }
}

#[tokio::test]
async fn test_keys_have_independent_buckets() {
    let now = start();
    for (name, limiter) in limiters() {
        let config = RateLimitConfig::fast(2, 1, 60_000);
        assert_eq!(admitted_count(limiter.as_ref(), "client_1", &config, now, 5).await, 2, "{}", name);
        assert_eq!(admitted_count(limiter.as_ref(), "client_2", &config, now, 5).await, 2, "{}", name);
    }
}

#[tokio::test]
async fn test_consistent_limit_holds_across_instances() {
    let now = start();
    let shared = Arc::new(MemoryCounterStore::new(IDLE));
    let a = ConsistentRateLimiter::new(shared.clone());
    let b = ConsistentRateLimiter::new(shared);
    let config = RateLimitConfig::consistent(6, 1, 60_000);

    let from_a = admitted_count(&a, "key_shared", &config, now, 4).await;
    let from_b = admitted_count(&b, "key_shared", &config, now, 4).await;
    assert_eq!(from_a + from_b, 6);

    // Fast buckets are per instance, so each one admits the full limit
    let c = FastRateLimiter::new(IDLE);
    let d = FastRateLimiter::new(IDLE);
    assert_eq!(admitted_count(&c, "key_shared", &config, now, 10).await, 6);
    assert_eq!(admitted_count(&d, "key_shared", &config, now, 10).await, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_counter_store_is_exact() {
    let now = start();
    let db = Arc::new(Database::in_memory().expect("Failed to create test database"));
    let a: Arc<dyn RateLimiter> = Arc::new(ConsistentRateLimiter::new(db.clone()));
    let b: Arc<dyn RateLimiter> = Arc::new(ConsistentRateLimiter::new(db.clone()));
    let config = RateLimitConfig::consistent(8, 1, 60_000);

    let mut handles = Vec::new();
    for i in 0..30 {
        let limiter = if i % 2 == 0 { a.clone() } else { b.clone() };
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            limiter.allow("key_sql", &config, now).await.unwrap().admitted
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 8);

    let stored = db.load("key_sql").await.unwrap().expect("bucket stored");
    assert_eq!(stored.state.tokens, 0);
    assert_eq!(stored.version, 8);
}

#[tokio::test]
async fn test_manager_without_config_is_unlimited() {
    let manager = RateLimitManager::in_memory(IDLE, FailurePolicy::Error);
    for _ in 0..100 {
        let decision = manager.allow("key_free", None, start()).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, None);
        assert_eq!(decision.reset_at, None);
    }
}

#[tokio::test]
async fn test_manager_routes_by_mode() {
    let now = start();
    let manager = RateLimitManager::in_memory(IDLE, FailurePolicy::Error);

    let fast = RateLimitConfig::fast(1, 1, 60_000);
    let consistent = RateLimitConfig::consistent(1, 1, 60_000);
    assert!(manager.allow("key_mode", Some(&fast), now).await.unwrap().admitted);
    // Separate strategies keep separate buckets
    assert!(manager.allow("key_mode", Some(&consistent), now).await.unwrap().admitted);
    assert!(!manager.allow("key_mode", Some(&fast), now).await.unwrap().admitted);
    assert!(!manager.allow("key_mode", Some(&consistent), now).await.unwrap().admitted);
}

#[tokio::test]
async fn test_manager_rejects_invalid_config() {
    let manager = RateLimitManager::in_memory(IDLE, FailurePolicy::Error);
    let broken = RateLimitConfig::fast(0, 1, 1000);
    let result = manager.allow("key_broken", Some(&broken), start()).await;
    assert!(matches!(result, Err(ApiError::RateLimiter(_))));
}

struct UnavailableStore;

#[async_trait]
impl CounterStore for UnavailableStore {
    async fn load(&self, _key: &str) -> Result<Option<Versioned>, ApiError> {
        Err(ApiError::Database("counter store unreachable".to_string()))
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<u64>,
        _state: BucketState,
    ) -> Result<bool, ApiError> {
        Err(ApiError::Database("counter store unreachable".to_string()))
    }
}

fn manager_over_unavailable_store(policy: FailurePolicy) -> RateLimitManager {
    RateLimitManager::new(
        Arc::new(FastRateLimiter::new(IDLE)),
        Arc::new(ConsistentRateLimiter::new(Arc::new(UnavailableStore))),
        policy,
    )
}

#[tokio::test]
async fn test_backend_failure_surfaces_by_default() {
    let manager = manager_over_unavailable_store(FailurePolicy::Error);
    let config = RateLimitConfig::consistent(5, 1, 1000);

    let err = manager.allow("key_down", Some(&config), start()).await.unwrap_err();
    assert!(err.is_internal());
}

#[tokio::test]
async fn test_backend_failure_can_fail_open() {
    let manager = manager_over_unavailable_store(FailurePolicy::Open);
    let config = RateLimitConfig::consistent(5, 1, 1000);

    let decision = manager.allow("key_down", Some(&config), start()).await.unwrap();
    assert!(decision.admitted);
    assert_eq!(decision.limit, Some(5));
    assert_eq!(decision.remaining, None);
}
