use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::errors::ApiError;
use crate::models::{Api, Credential, Workspace};

/// Durable credential records. `Ok(None)` is an authoritative "not found".
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Credential>, ApiError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Credential>, ApiError>;

    async fn insert(&self, credential: &Credential) -> Result<(), ApiError>;

    /// Sets `remaining` to `new` only if it currently equals `expected`.
    /// Returns whether the write was applied.
    async fn update_remaining(&self, id: &str, expected: u64, new: u64) -> Result<bool, ApiError>;

    /// Unconditional overwrite, for management updates.
    async fn set_remaining(&self, id: &str, remaining: Option<u64>) -> Result<bool, ApiError>;

    /// Marks the credential deleted. Never overwrites an existing `deleted_at`;
    /// returns false if the key is missing or already deleted.
    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> Result<bool, ApiError>;
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn find_api_by_key_auth(&self, key_auth_id: &str) -> Result<Option<Api>, ApiError>;

    async fn find_workspace(&self, id: &str) -> Result<Option<Workspace>, ApiError>;

    async fn insert_api(&self, api: &Api) -> Result<(), ApiError>;

    async fn insert_workspace(&self, workspace: &Workspace) -> Result<(), ApiError>;
}

#[derive(Default)]
struct Tables {
    keys: HashMap<String, Credential>,
    key_ids_by_hash: HashMap<String, String>,
    apis: HashMap<String, Api>,
    workspaces: HashMap<String, Workspace>,
}

/// In-process store, for tests and single-binary deployments.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Credential>, ApiError> {
        let tables = self.tables.read();
        Ok(tables
            .key_ids_by_hash
            .get(hash)
            .and_then(|id| tables.keys.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Credential>, ApiError> {
        Ok(self.tables.read().keys.get(id).cloned())
    }

    async fn insert(&self, credential: &Credential) -> Result<(), ApiError> {
        let mut tables = self.tables.write();
        if tables.key_ids_by_hash.contains_key(&credential.hash) {
            return Err(ApiError::InvalidRequest("duplicate key hash".to_string()));
        }
        tables
            .key_ids_by_hash
            .insert(credential.hash.clone(), credential.id.clone());
        tables.keys.insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn update_remaining(&self, id: &str, expected: u64, new: u64) -> Result<bool, ApiError> {
        let mut tables = self.tables.write();
        match tables.keys.get_mut(id) {
            Some(key) if key.remaining == Some(expected) => {
                key.remaining = Some(new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_remaining(&self, id: &str, remaining: Option<u64>) -> Result<bool, ApiError> {
        let mut tables = self.tables.write();
        match tables.keys.get_mut(id) {
            Some(key) => {
                key.remaining = remaining;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> Result<bool, ApiError> {
        let mut tables = self.tables.write();
        match tables.keys.get_mut(id) {
            Some(key) if key.deleted_at.is_none() => {
                key.deleted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn find_api_by_key_auth(&self, key_auth_id: &str) -> Result<Option<Api>, ApiError> {
        Ok(self
            .tables
            .read()
            .apis
            .values()
            .find(|api| api.auth.key_auth_id() == Some(key_auth_id))
            .cloned())
    }

    async fn find_workspace(&self, id: &str) -> Result<Option<Workspace>, ApiError> {
        Ok(self.tables.read().workspaces.get(id).cloned())
    }

    async fn insert_api(&self, api: &Api) -> Result<(), ApiError> {
        self.tables.write().apis.insert(api.id.clone(), api.clone());
        Ok(())
    }

    async fn insert_workspace(&self, workspace: &Workspace) -> Result<(), ApiError> {
        self.tables
            .write()
            .workspaces
            .insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }
}
