#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use key_verifier::{
    clock::ManualClock,
    engine::VerificationEngine,
    errors::ApiError,
    events::{Event, EventSink},
    models::{Api, Credential, VerificationResult, VerifyKeyRequest, Workspace},
    security::{generate_key, hash_key},
    store::{CredentialStore, MemoryStore, ResourceStore},
};

/// Memory store that counts hash lookups and can be made slow or failing.
pub struct CountingStore {
    inner: MemoryStore,
    hash_lookups: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
}

impl CountingStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            hash_lookups: AtomicUsize::new(0),
            delay,
            failing: AtomicBool::new(false),
        }
    }

    pub fn hash_lookups(&self) -> usize {
        self.hash_lookups.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialStore for CountingStore {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Credential>, ApiError> {
        self.hash_lookups.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Database("connection refused".to_string()));
        }
        self.inner.find_by_hash(hash).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Credential>, ApiError> {
        self.inner.find_by_id(id).await
    }

    async fn insert(&self, credential: &Credential) -> Result<(), ApiError> {
        self.inner.insert(credential).await
    }

    async fn update_remaining(&self, id: &str, expected: u64, new: u64) -> Result<bool, ApiError> {
        self.inner.update_remaining(id, expected, new).await
    }

    async fn set_remaining(&self, id: &str, remaining: Option<u64>) -> Result<bool, ApiError> {
        self.inner.set_remaining(id, remaining).await
    }

    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> Result<bool, ApiError> {
        self.inner.soft_delete(id, at).await
    }
}

#[async_trait]
impl ResourceStore for CountingStore {
    async fn find_api_by_key_auth(&self, key_auth_id: &str) -> Result<Option<Api>, ApiError> {
        self.inner.find_api_by_key_auth(key_auth_id).await
    }

    async fn find_workspace(&self, id: &str) -> Result<Option<Workspace>, ApiError> {
        self.inner.find_workspace(id).await
    }

    async fn insert_api(&self, api: &Api) -> Result<(), ApiError> {
        self.inner.insert_api(api).await
    }

    async fn insert_workspace(&self, workspace: &Workspace) -> Result<(), ApiError> {
        self.inner.insert_workspace(workspace).await
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

pub struct Fixture {
    pub store: Arc<CountingStore>,
    pub engine: Arc<VerificationEngine>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingSink>,
    pub workspace: Workspace,
    pub api: Api,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_delay(Duration::ZERO).await
    }

    pub async fn with_delay(delay: Duration) -> Self {
        let store = Arc::new(CountingStore::new(delay));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let events = Arc::new(RecordingSink::default());

        let workspace = Workspace::new("acme");
        let api = Api::with_key_auth(&workspace.id, "billing", "ks_billing");
        store.insert_workspace(&workspace).await.expect("insert workspace");
        store.insert_api(&api).await.expect("insert api");

        let engine = VerificationEngine::builder(store.clone(), store.clone(), events.clone())
            .clock(clock.clone())
            .build();

        Self {
            store,
            engine: Arc::new(engine),
            clock,
            events,
            workspace,
            api,
        }
    }

    /// Issues a key in the fixture's API and returns the raw secret with the record.
    pub async fn add_key<F>(&self, customize: F) -> (String, Credential)
    where
        F: FnOnce(Credential) -> Credential,
    {
        let raw = generate_key("test").expect("generate key");
        let key = customize(Credential::new("ks_billing", &self.workspace.id, &hash_key(&raw)));
        self.store.insert(&key).await.expect("insert key");
        (raw, key)
    }

    pub async fn verify(&self, raw: &str) -> VerificationResult {
        self.engine
            .verify(&VerifyKeyRequest::new(raw))
            .await
            .expect("verification should reach a decision")
    }

    pub async fn stored(&self, key_id: &str) -> Credential {
        self.store
            .find_by_id(key_id)
            .await
            .expect("lookup")
            .expect("key exists")
    }
}
