use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RateLimitMode {
    /// Per-process buckets, lazily refilled. Best effort across instances.
    Fast,
    /// Buckets in a shared counter store, updated by compare-and-swap.
    Consistent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub mode: RateLimitMode,
    pub limit: u64,
    pub refill_rate: u64,
    pub refill_interval_ms: u64,
}

impl RateLimitConfig {
    pub fn fast(limit: u64, refill_rate: u64, refill_interval_ms: u64) -> Self {
        Self {
            mode: RateLimitMode::Fast,
            limit,
            refill_rate,
            refill_interval_ms,
        }
    }

    pub fn consistent(limit: u64, refill_rate: u64, refill_interval_ms: u64) -> Self {
        Self {
            mode: RateLimitMode::Consistent,
            limit,
            refill_rate,
            refill_interval_ms,
        }
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if self.limit == 0 || self.refill_rate == 0 || self.refill_interval_ms == 0 {
            return Err(ApiError::InvalidRequest(
                "rate limit, refill rate and refill interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A verifiable API key. Only the hash of the secret is ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    /// The key-auth namespace this key belongs to.
    pub key_auth_id: String,
    pub workspace_id: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    /// Write-once. A deleted key never becomes valid again.
    pub deleted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// `None` means unlimited uses.
    pub remaining: Option<u64>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Credential {
    pub fn new(key_auth_id: &str, workspace_id: &str, hash: &str) -> Self {
        Self {
            id: format!("key_{}", uuid::Uuid::new_v4().simple()),
            key_auth_id: key_auth_id.to_string(),
            workspace_id: workspace_id.to_string(),
            hash: hash.to_string(),
            created_at: Utc::now(),
            deleted_at: None,
            expires_at: None,
            remaining: None,
            rate_limit: None,
        }
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_remaining(mut self, remaining: u64) -> Self {
        self.remaining = Some(remaining);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthType {
    Key,
    Jwt,
}

/// How an API authenticates callers. Exactly one namespace is referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ApiAuth {
    Key { key_auth_id: String },
    Jwt { jwt_auth_id: String },
}

impl ApiAuth {
    pub fn auth_type(&self) -> AuthType {
        match self {
            ApiAuth::Key { .. } => AuthType::Key,
            ApiAuth::Jwt { .. } => AuthType::Jwt,
        }
    }

    pub fn key_auth_id(&self) -> Option<&str> {
        match self {
            ApiAuth::Key { key_auth_id } => Some(key_auth_id),
            ApiAuth::Jwt { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Api {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Empty means every source address is allowed.
    pub ip_whitelist: Vec<String>,
    pub auth: ApiAuth,
}

impl Api {
    pub fn with_key_auth(workspace_id: &str, name: &str, key_auth_id: &str) -> Self {
        Self {
            id: format!("api_{}", uuid::Uuid::new_v4().simple()),
            workspace_id: workspace_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            deleted_at: None,
            ip_whitelist: Vec::new(),
            auth: ApiAuth::Key {
                key_auth_id: key_auth_id.to_string(),
            },
        }
    }

    pub fn allows_ip(&self, source_ip: Option<&str>) -> bool {
        if self.ip_whitelist.is_empty() {
            return true;
        }
        match source_ip {
            Some(ip) => self.ip_whitelist.iter().any(|allowed| allowed == ip),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub enabled: bool,
}

impl Workspace {
    pub fn new(name: &str) -> Self {
        Self {
            id: format!("ws_{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            enabled: true,
        }
    }
}

/// Outcome of a verification that reached a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Valid,
    NotFound,
    Revoked,
    Expired,
    Disabled,
    Forbidden,
    RateLimited,
    QuotaExhausted,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Valid => "VALID",
            ReasonCode::NotFound => "NOT_FOUND",
            ReasonCode::Revoked => "REVOKED",
            ReasonCode::Expired => "EXPIRED",
            ReasonCode::Disabled => "DISABLED",
            ReasonCode::Forbidden => "FORBIDDEN",
            ReasonCode::RateLimited => "RATE_LIMITED",
            ReasonCode::QuotaExhausted => "QUOTA_EXHAUSTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub admitted: bool,
    /// `None` when the key has no rate limit.
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitDecision {
    pub fn unlimited() -> Self {
        Self {
            admitted: true,
            limit: None,
            remaining: None,
            reset_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub code: ReasonCode,
    pub key_id: Option<String>,
    pub workspace_id: Option<String>,
    pub remaining: Option<u64>,
    pub rate_limit: Option<RateLimitDecision>,
}

impl VerificationResult {
    pub fn not_found() -> Self {
        Self {
            valid: false,
            code: ReasonCode::NotFound,
            key_id: None,
            workspace_id: None,
            remaining: None,
            rate_limit: None,
        }
    }

    pub fn for_key(key: &Credential, code: ReasonCode) -> Self {
        Self {
            valid: code == ReasonCode::Valid,
            code,
            key_id: Some(key.id.clone()),
            workspace_id: Some(key.workspace_id.clone()),
            remaining: key.remaining,
            rate_limit: None,
        }
    }

    pub fn rate_limit_remaining(&self) -> Option<u64> {
        self.rate_limit.as_ref().and_then(|d| d.remaining)
    }

    pub fn rate_limit_reset_at(&self) -> Option<DateTime<Utc>> {
        self.rate_limit.as_ref().and_then(|d| d.reset_at)
    }
}

// Request/Response models
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyKeyRequest {
    pub key: String,
    #[serde(default)]
    pub source_ip: Option<String>,
    /// Give up (with no quota consumed) if no decision is reached in time.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl VerifyKeyRequest {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatelimitResponse {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds of the next refill.
    pub reset: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyKeyResponse {
    pub valid: bool,
    pub code: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratelimit: Option<RatelimitResponse>,
}

impl From<VerificationResult> for VerifyKeyResponse {
    fn from(result: VerificationResult) -> Self {
        let ratelimit = result.rate_limit.and_then(|d| match (d.limit, d.remaining) {
            (Some(limit), Some(remaining)) => Some(RatelimitResponse {
                limit,
                remaining,
                reset: d.reset_at.map(|at| at.timestamp_millis()),
            }),
            _ => None,
        });
        Self {
            valid: result.valid,
            code: result.code,
            key_id: result.key_id,
            remaining: result.remaining,
            ratelimit,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteKeyRequest {
    pub workspace_id: String,
    pub key_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRemainingRequest {
    pub workspace_id: String,
    pub key_id: String,
    pub remaining: Option<u64>,
}
