// API key verification with rate limits and usage quotas
// Main library module

pub mod cache;
pub mod clock;
pub mod config;
pub mod database;
pub mod engine;
pub mod errors;
pub mod events;
pub mod models;
pub mod quota;
pub mod rate_limit;
pub mod security;
pub mod store;

// Re-export commonly used items
pub use cache::{Cache, CacheConfig, MemoryCache};
pub use config::{Config, FailurePolicy};
pub use database::Database;
pub use engine::VerificationEngine;
pub use errors::ApiError;
pub use events::{ChannelEventSink, Event, EventKind, EventSink};
pub use models::{
    Api, Credential, RateLimitConfig, RateLimitMode, ReasonCode, VerificationResult,
    VerifyKeyRequest, Workspace,
};
pub use store::{CredentialStore, MemoryStore, ResourceStore};
