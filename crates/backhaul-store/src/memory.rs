//! Process-local store
//!
//! Used for single-node deployments and tests. Expiry uses tokio's clock so
//! paused-time tests can drive TTLs deterministically.

use crate::{RemoteStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
enum Value {
    Hash(Vec<(String, String)>),
    Plain {
        value: String,
        expires_at: Option<Instant>,
    },
}

/// In-memory implementation of [`RemoteStore`]
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (every call fails until re-enabled)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Plain value of a key, if present and not expired
    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(Value::Plain { value, expires_at }) if !is_expired(*expires_at) => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    /// One field of a hash, if present
    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(Value::Hash(fields)) => fields
                .iter()
                .find(|(f, _)| f == field)
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory store disabled".to_string(),
            ))
        }
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, Value>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(expires_at: Option<Instant>) -> bool {
    expires_at.is_some_and(|at| Instant::now() >= at)
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        self.check()?;
        let mut entries = self.lock()?;

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(Vec::new()));
        if !matches!(entry, Value::Hash(_)) {
            *entry = Value::Hash(Vec::new());
        }

        if let Value::Hash(existing) = entry {
            for (field, value) in fields {
                match existing.iter_mut().find(|(f, _)| f == field) {
                    Some(slot) => slot.1 = value.clone(),
                    None => existing.push((field.clone(), value.clone())),
                }
            }
        }
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<()> {
        self.check()?;
        let mut entries = self.lock()?;

        let now_empty = match entries.get_mut(key) {
            Some(Value::Hash(existing)) => {
                existing.retain(|(f, _)| f != field);
                existing.is_empty()
            }
            _ => false,
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        self.check()?;
        let entries = self.lock()?;

        match entries.get(key) {
            Some(Value::Hash(existing)) => Ok(existing.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        let mut entries = self.lock()?;

        entries.insert(
            key.to_string(),
            Value::Plain {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let mut entries = self.lock()?;

        let expired = match entries.get(key) {
            None => return Ok(false),
            Some(Value::Plain { expires_at, .. }) => is_expired(*expires_at),
            Some(Value::Hash(_)) => false,
        };
        if expired {
            entries.remove(key);
            return Ok(false);
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.lock()?.remove(key);
        Ok(())
    }
}
