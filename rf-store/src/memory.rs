//! In-process expiring store.
//!
//! Mirrors the Redis command semantics the engine depends on, with lazy
//! expiry evaluated against an injected [`Clock`]. Suitable for single-process
//! deployments and for tests.

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError};
use crate::traits::ExpiringStore;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use globset::{GlobBuilder, GlobMatcher};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum StoredValue {
    List(VecDeque<String>),
    Scalar(String),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at_millis: Option<i64>,
}

impl StoredEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at_millis.is_some_and(|at| at <= now)
    }
}

pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Eagerly drop every expired key. Returns how many were reclaimed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    fn evict_if_expired(&self, key: &str, now: i64) {
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

#[async_trait]
impl ExpiringStore for MemoryStore {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        let now = self.clock.now_millis();
        self.evict_if_expired(key, now);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match &mut occupied.get_mut().value {
                StoredValue::List(items) => {
                    items.push_back(value.to_string());
                    Ok(items.len())
                }
                StoredValue::Scalar(_) => Err(wrong_type(key, "list")),
            },
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry {
                    value: StoredValue::List(VecDeque::from([value.to_string()])),
                    expires_at_millis: None,
                });
                Ok(1)
            }
        }
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let now = self.clock.now_millis();
        self.evict_if_expired(key, now);
        let Some(entry) = self.entries.get(key) else {
            return Ok(Vec::new());
        };
        match &entry.value {
            StoredValue::List(items) => Ok(items.iter().cloned().collect()),
            StoredValue::Scalar(_) => Err(wrong_type(key, "list")),
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let now = self.clock.now_millis();
        self.evict_if_expired(key, now);
        let Some(entry) = self.entries.get(key) else {
            return Ok(0);
        };
        match &entry.value {
            StoredValue::List(items) => Ok(items.len()),
            StoredValue::Scalar(_) => Err(wrong_type(key, "list")),
        }
    }

    async fn list_trim_front(&self, key: &str, count: usize) -> Result<()> {
        let now = self.clock.now_millis();
        self.evict_if_expired(key, now);
        let Entry::Occupied(mut occupied) = self.entries.entry(key.to_string()) else {
            return Ok(());
        };
        let now_empty = match &mut occupied.get_mut().value {
            StoredValue::List(items) => {
                let n = count.min(items.len());
                items.drain(..n);
                items.is_empty()
            }
            StoredValue::Scalar(_) => return Err(wrong_type(key, "list")),
        };
        if now_empty {
            occupied.remove();
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_millis();
        self.evict_if_expired(key, now);
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        match &entry.value {
            StoredValue::Scalar(value) => Ok(Some(value.clone())),
            StoredValue::List(_) => Err(wrong_type(key, "string")),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now_millis();
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Scalar(value.to_string()),
                expires_at_millis: Some(now.saturating_add(ttl_millis(ttl))),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_millis();
        self.evict_if_expired(key, now);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry {
                    value: StoredValue::Scalar(value.to_string()),
                    expires_at_millis: Some(now.saturating_add(ttl_millis(ttl))),
                });
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let now = self.clock.now_millis();
        self.evict_if_expired(key, now);
        let removed = self.entries.remove_if(key, |_, entry| {
            matches!(&entry.value, StoredValue::Scalar(value) if value == expected)
        });
        Ok(removed.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_millis();
        self.evict_if_expired(key, now);
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };
        entry.expires_at_millis = Some(now.saturating_add(ttl_millis(ttl)));
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = key_matcher(pattern)?;
        let now = self.clock.now_millis();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Compile a Redis `MATCH` pattern. Keys are flat strings, so `*` also
/// crosses `/` and `:`.
fn key_matcher(pattern: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map_err(|e| StoreError::Protocol(format!("invalid key pattern {pattern:?}: {e}")))?;
    Ok(glob.compile_matcher())
}
