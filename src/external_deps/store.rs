//! Persistence collaborator.
//!
//! Stores fingerprint profiles, cookie sets and test results. Lookups happen
//! before a run acquires any identity and the result is written only after the
//! identity is released, so store latency never extends a tunnel's lifetime.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::fingerprint::{CookieSet, FingerprintProfile};
use crate::orchestrator::TestResult;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(String),
    #[error("store task failed: {0}")]
    Task(String),
}

fn db_err<E: Into<redb::Error>>(err: E) -> StoreError {
    StoreError::Database(err.into().to_string())
}

/// A persisted result with the id the store assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub id: u64,
    pub result: TestResult,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn load_fingerprint(&self, id: u64) -> Result<Option<FingerprintProfile>, StoreError>;
    async fn load_cookie_set(&self, id: u64) -> Result<Option<CookieSet>, StoreError>;
    /// Persists `result`, bumps the usage counter of its cookie set and
    /// returns the new record id.
    async fn save_result(&self, result: &TestResult) -> Result<u64, StoreError>;
    async fn list_results(&self) -> Result<Vec<StoredResult>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    fingerprints: HashMap<u64, FingerprintProfile>,
    cookie_sets: HashMap<u64, CookieSet>,
    results: Vec<StoredResult>,
}

/// In-process store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_fingerprint(&self, profile: FingerprintProfile) {
        self.state().fingerprints.insert(profile.id, profile);
    }

    pub fn insert_cookie_set(&self, cookies: CookieSet) {
        self.state().cookie_sets.insert(cookies.id, cookies);
    }

    pub fn cookie_set(&self, id: u64) -> Option<CookieSet> {
        self.state().cookie_sets.get(&id).cloned()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn load_fingerprint(&self, id: u64) -> Result<Option<FingerprintProfile>, StoreError> {
        Ok(self.state().fingerprints.get(&id).cloned())
    }

    async fn load_cookie_set(&self, id: u64) -> Result<Option<CookieSet>, StoreError> {
        Ok(self.state().cookie_sets.get(&id).cloned())
    }

    async fn save_result(&self, result: &TestResult) -> Result<u64, StoreError> {
        let mut state = self.state();
        let id = state.results.len() as u64 + 1;
        state.results.push(StoredResult {
            id,
            result: result.clone(),
        });
        if let Some(cookie_id) = result.cookie_set_id
            && let Some(cookies) = state.cookie_sets.get_mut(&cookie_id)
        {
            cookies.usage_count += 1;
        }
        Ok(id)
    }

    async fn list_results(&self) -> Result<Vec<StoredResult>, StoreError> {
        Ok(self.state().results.clone())
    }
}

type JsonTable = TableDefinition<'static, u64, &'static str>;

const FINGERPRINTS: JsonTable = TableDefinition::new("fingerprints");
const COOKIE_SETS: JsonTable = TableDefinition::new("cookie_sets");
const RESULTS: JsonTable = TableDefinition::new("test_results");

/// Embedded on-disk store; every row is a JSON document keyed by id.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Opens or creates the database file and its tables.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(db_err)?;
        let txn = db.begin_write().map_err(db_err)?;
        for table in [FINGERPRINTS, COOKIE_SETS, RESULTS] {
            txn.open_table(table).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn put_fingerprint(&self, profile: &FingerprintProfile) -> Result<(), StoreError> {
        put_json(&self.db, FINGERPRINTS, profile.id, &serde_json::to_string(profile)?)
    }

    pub fn put_cookie_set(&self, cookies: &CookieSet) -> Result<(), StoreError> {
        put_json(&self.db, COOKIE_SETS, cookies.id, &serde_json::to_string(cookies)?)
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || work(&db))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

fn put_json(db: &Database, table: JsonTable, key: u64, value: &str) -> Result<(), StoreError> {
    let txn = db.begin_write().map_err(db_err)?;
    {
        let mut table = txn.open_table(table).map_err(db_err)?;
        table.insert(key, value).map_err(db_err)?;
    }
    txn.commit().map_err(db_err)
}

fn get_json<T: DeserializeOwned>(db: &Database, table: JsonTable, key: u64) -> Result<Option<T>, StoreError> {
    let txn = db.begin_read().map_err(db_err)?;
    let table = txn.open_table(table).map_err(db_err)?;
    match table.get(key).map_err(db_err)? {
        Some(row) => Ok(Some(serde_json::from_str(row.value())?)),
        None => Ok(None),
    }
}

#[async_trait]
impl ResultStore for RedbStore {
    async fn load_fingerprint(&self, id: u64) -> Result<Option<FingerprintProfile>, StoreError> {
        self.blocking(move |db| get_json(db, FINGERPRINTS, id)).await
    }

    async fn load_cookie_set(&self, id: u64) -> Result<Option<CookieSet>, StoreError> {
        self.blocking(move |db| get_json(db, COOKIE_SETS, id)).await
    }

    async fn save_result(&self, result: &TestResult) -> Result<u64, StoreError> {
        let row = serde_json::to_string(result)?;
        let cookie_id = result.cookie_set_id;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            let id = {
                let mut results = txn.open_table(RESULTS).map_err(db_err)?;
                let id = results
                    .last()
                    .map_err(db_err)?
                    .map(|(key, _)| key.value() + 1)
                    .unwrap_or(1);
                results.insert(id, row.as_str()).map_err(db_err)?;
                id
            };
            if let Some(cookie_id) = cookie_id {
                let mut cookie_sets = txn.open_table(COOKIE_SETS).map_err(db_err)?;
                let stored = cookie_sets
                    .get(cookie_id)
                    .map_err(db_err)?
                    .map(|row| row.value().to_string());
                if let Some(raw) = stored {
                    let mut cookies: CookieSet = serde_json::from_str(&raw)?;
                    cookies.usage_count += 1;
                    let updated = serde_json::to_string(&cookies)?;
                    cookie_sets.insert(cookie_id, updated.as_str()).map_err(db_err)?;
                }
            }
            txn.commit().map_err(db_err)?;
            Ok(id)
        })
        .await
    }

    async fn list_results(&self) -> Result<Vec<StoredResult>, StoreError> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(RESULTS).map_err(db_err)?;
            let mut rows = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (key, value) = entry.map_err(db_err)?;
                rows.push(StoredResult {
                    id: key.value(),
                    result: serde_json::from_str(value.value())?,
                });
            }
            Ok(rows)
        })
        .await
    }
}
