use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::errors::ApiError;
use crate::events::{Event, EventHandler};
use crate::models::{Api, ApiAuth, Credential, RateLimitConfig, Workspace};
use crate::rate_limit::{BucketState, CounterStore, Versioned};
use crate::store::{CredentialStore, ResourceStore};

const KEY_COLUMNS: &str =
    "id, key_auth_id, workspace_id, hash, created_at, deleted_at, expires_at, remaining, rate_limit";

const API_COLUMNS: &str =
    "id, workspace_id, name, created_at, deleted_at, ip_whitelist, key_auth_id, jwt_auth_id";

/// SQLite persistence. Calls run on the blocking pool.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(path: &str) -> Result<Self, ApiError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, ApiError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ApiError> {
        conn.execute_batch(include_str!("../db/schema.sql"))?;
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ApiError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&*conn)
        })
        .await?
    }

    pub async fn usage_log_count(&self, key_id: &str) -> Result<u64, ApiError> {
        let key_id = key_id.to_string();
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM usage_logs WHERE key_id = ?",
                params![key_id],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

fn to_sql_int(value: u64) -> Result<i64, ApiError> {
    i64::try_from(value).map_err(|_| ApiError::InvalidRequest(format!("{} is out of range", value)))
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn timestamp(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|millis| timestamp(idx, millis))
        .transpose()
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let remaining = row
        .get::<_, Option<i64>>(7)?
        .map(|value| u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(7, value)))
        .transpose()?;
    let rate_limit = row
        .get::<_, Option<String>>(8)?
        .map(|json| {
            serde_json::from_str::<RateLimitConfig>(&json).map_err(|e| conversion_error(8, Type::Text, e))
        })
        .transpose()?;

    Ok(Credential {
        id: row.get(0)?,
        key_auth_id: row.get(1)?,
        workspace_id: row.get(2)?,
        hash: row.get(3)?,
        created_at: timestamp(4, row.get(4)?)?,
        deleted_at: optional_timestamp(row, 5)?,
        expires_at: optional_timestamp(row, 6)?,
        remaining,
        rate_limit,
    })
}

fn api_from_row(row: &Row<'_>) -> rusqlite::Result<Api> {
    let whitelist_json: String = row.get(5)?;
    let ip_whitelist: Vec<String> =
        serde_json::from_str(&whitelist_json).map_err(|e| conversion_error(5, Type::Text, e))?;

    let key_auth_id: Option<String> = row.get(6)?;
    let jwt_auth_id: Option<String> = row.get(7)?;
    let auth = match (key_auth_id, jwt_auth_id) {
        (Some(key_auth_id), None) => ApiAuth::Key { key_auth_id },
        (None, Some(jwt_auth_id)) => ApiAuth::Jwt { jwt_auth_id },
        _ => return Err(rusqlite::Error::InvalidColumnType(6, "key_auth_id".to_string(), Type::Null)),
    };

    Ok(Api {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        created_at: timestamp(3, row.get(3)?)?,
        deleted_at: optional_timestamp(row, 4)?,
        ip_whitelist,
        auth,
    })
}

#[async_trait]
impl CredentialStore for Database {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Credential>, ApiError> {
        let hash = hash.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {} FROM keys WHERE hash = ?", KEY_COLUMNS))?;
            Ok(stmt.query_row(params![hash], key_from_row).optional()?)
        })
        .await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Credential>, ApiError> {
        let id = id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {} FROM keys WHERE id = ?", KEY_COLUMNS))?;
            Ok(stmt.query_row(params![id], key_from_row).optional()?)
        })
        .await
    }

    async fn insert(&self, credential: &Credential) -> Result<(), ApiError> {
        let key = credential.clone();
        let remaining = key.remaining.map(to_sql_int).transpose()?;
        let rate_limit = key.rate_limit.as_ref().map(serde_json::to_string).transpose()?;

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO keys (id, key_auth_id, workspace_id, hash, created_at, deleted_at, expires_at, remaining, rate_limit) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    key.id,
                    key.key_auth_id,
                    key.workspace_id,
                    key.hash,
                    key.created_at.timestamp_millis(),
                    key.deleted_at.map(|at| at.timestamp_millis()),
                    key.expires_at.map(|at| at.timestamp_millis()),
                    remaining,
                    rate_limit,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_remaining(&self, id: &str, expected: u64, new: u64) -> Result<bool, ApiError> {
        let id = id.to_string();
        let expected = to_sql_int(expected)?;
        let new = to_sql_int(new)?;
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE keys SET remaining = ? WHERE id = ? AND remaining = ?",
                params![new, id, expected],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn set_remaining(&self, id: &str, remaining: Option<u64>) -> Result<bool, ApiError> {
        let id = id.to_string();
        let remaining = remaining.map(to_sql_int).transpose()?;
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE keys SET remaining = ? WHERE id = ?",
                params![remaining, id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> Result<bool, ApiError> {
        let id = id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE keys SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
                params![at.timestamp_millis(), id],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

#[async_trait]
impl ResourceStore for Database {
    async fn find_api_by_key_auth(&self, key_auth_id: &str) -> Result<Option<Api>, ApiError> {
        let key_auth_id = key_auth_id.to_string();
        self.run(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM apis WHERE key_auth_id = ?", API_COLUMNS))?;
            Ok(stmt.query_row(params![key_auth_id], api_from_row).optional()?)
        })
        .await
    }

    async fn find_workspace(&self, id: &str) -> Result<Option<Workspace>, ApiError> {
        let id = id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare("SELECT id, name, enabled FROM workspaces WHERE id = ?")?;
            let workspace = stmt
                .query_row(params![id], |row| {
                    Ok(Workspace {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        enabled: row.get(2)?,
                    })
                })
                .optional()?;
            Ok(workspace)
        })
        .await
    }

    async fn insert_api(&self, api: &Api) -> Result<(), ApiError> {
        let api = api.clone();
        let ip_whitelist = serde_json::to_string(&api.ip_whitelist)?;
        let (key_auth_id, jwt_auth_id) = match &api.auth {
            ApiAuth::Key { key_auth_id } => (Some(key_auth_id.clone()), None),
            ApiAuth::Jwt { jwt_auth_id } => (None, Some(jwt_auth_id.clone())),
        };

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO apis (id, workspace_id, name, created_at, deleted_at, ip_whitelist, key_auth_id, jwt_auth_id) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    api.id,
                    api.workspace_id,
                    api.name,
                    api.created_at.timestamp_millis(),
                    api.deleted_at.map(|at| at.timestamp_millis()),
                    ip_whitelist,
                    key_auth_id,
                    jwt_auth_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_workspace(&self, workspace: &Workspace) -> Result<(), ApiError> {
        let workspace = workspace.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO workspaces (id, name, enabled) VALUES (?, ?, ?)",
                params![workspace.id, workspace.name, workspace.enabled],
            )?;
            Ok(())
        })
        .await
    }
}

// Shared buckets for CONSISTENT rate limiting, so every process using the
// same database file enforces one limit.
#[async_trait]
impl CounterStore for Database {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, ApiError> {
        let key = key.to_string();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT tokens, last_refill_ms, version FROM rate_limit_buckets WHERE key = ?",
                    params![key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
                )
                .optional()?;

            Ok(row.map(|(tokens, last_refill_ms, version)| Versioned {
                version: version.max(0) as u64,
                state: BucketState {
                    tokens: tokens.max(0) as u64,
                    last_refill_ms,
                },
            }))
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: BucketState,
    ) -> Result<bool, ApiError> {
        let key = key.to_string();
        let tokens = to_sql_int(state.tokens)?;
        let expected = expected.map(to_sql_int).transpose()?;

        self.run(move |conn| {
            let changed = match expected {
                None => conn.execute(
                    "INSERT OR IGNORE INTO rate_limit_buckets (key, tokens, last_refill_ms, version) VALUES (?, ?, ?, 1)",
                    params![key, tokens, state.last_refill_ms],
                )?,
                Some(version) => conn.execute(
                    "UPDATE rate_limit_buckets SET tokens = ?, last_refill_ms = ?, version = version + 1 WHERE key = ? AND version = ?",
                    params![tokens, state.last_refill_ms, key, version],
                )?,
            };
            Ok(changed == 1)
        })
        .await
    }
}

#[async_trait]
impl EventHandler for Database {
    async fn handle(&self, event: Event) -> Result<(), ApiError> {
        let kind = serde_json::to_string(&event.kind)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO usage_logs (key_id, workspace_id, kind, source_ip, created_at) VALUES (?, ?, ?, ?, ?)",
                params![
                    event.key_id,
                    event.workspace_id,
                    kind,
                    event.source_ip,
                    event.time.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}
