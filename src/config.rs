use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ApiError;

/// What to do when the rate limiter's backing store fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Surface the failure as an internal error.
    Error,
    /// Admit the request and log a warning.
    Open,
}

impl FromStr for FailurePolicy {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(FailurePolicy::Error),
            "open" => Ok(FailurePolicy::Open),
            other => Err(ApiError::Config(format!(
                "unknown rate limit failure policy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub bind_addr: SocketAddr,
    pub cache_ttl: Duration,
    pub negative_cache_ttl: Duration,
    pub cache_max_entries: u64,
    pub rate_limit_idle: Duration,
    pub event_queue_capacity: usize,
    pub rate_limit_failure_policy: FailurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "db/keys.db".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            cache_ttl: Duration::from_secs(60),
            negative_cache_ttl: Duration::from_secs(5),
            cache_max_entries: 100_000,
            rate_limit_idle: Duration::from_secs(300),
            event_queue_capacity: 1024,
            rate_limit_failure_policy: FailurePolicy::Error,
        }
    }
}

impl Config {
    // Load from the process environment, after reading .env if present
    pub fn from_env() -> Result<Self, ApiError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ApiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let config = Config {
            database_path: lookup("DATABASE_PATH").unwrap_or(defaults.database_path),
            bind_addr: parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            cache_ttl: Duration::from_secs(parse_or(
                &lookup,
                "CACHE_TTL_SECS",
                defaults.cache_ttl.as_secs(),
            )?),
            negative_cache_ttl: Duration::from_secs(parse_or(
                &lookup,
                "NEGATIVE_CACHE_TTL_SECS",
                defaults.negative_cache_ttl.as_secs(),
            )?),
            cache_max_entries: parse_or(&lookup, "CACHE_MAX_ENTRIES", defaults.cache_max_entries)?,
            rate_limit_idle: Duration::from_secs(parse_or(
                &lookup,
                "RATE_LIMIT_IDLE_SECS",
                defaults.rate_limit_idle.as_secs(),
            )?),
            event_queue_capacity: parse_or(
                &lookup,
                "EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity,
            )?,
            rate_limit_failure_policy: parse_or(
                &lookup,
                "RATE_LIMIT_FAILURE_POLICY",
                defaults.rate_limit_failure_policy,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if self.cache_ttl.is_zero() {
            return Err(ApiError::Config("CACHE_TTL_SECS must be positive".to_string()));
        }
        if self.negative_cache_ttl > self.cache_ttl {
            return Err(ApiError::Config(
                "NEGATIVE_CACHE_TTL_SECS must not exceed CACHE_TTL_SECS".to_string(),
            ));
        }
        if self.cache_max_entries == 0 {
            return Err(ApiError::Config("CACHE_MAX_ENTRIES must be positive".to_string()));
        }
        if self.event_queue_capacity == 0 {
            return Err(ApiError::Config(
                "EVENT_QUEUE_CAPACITY must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ApiError::Config(format!("{}: {}", name, e))),
        None => Ok(default),
    }
}
