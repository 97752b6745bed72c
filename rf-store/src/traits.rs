use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Shared key-value store with ordered lists, scalars and per-key expiry.
///
/// Every method maps to a single atomic store command; callers compose them
/// without transactions.
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    /// Human-readable backend name: "memory", "redis".
    fn backend(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    /// Append to the tail of a list, creating it if needed. Returns the new length.
    async fn list_push(&self, key: &str, value: &str) -> Result<usize>;

    /// Whole-list snapshot, head first. Absent key reads as empty.
    async fn list_range(&self, key: &str) -> Result<Vec<String>>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    /// Drop the first `count` entries. A list trimmed to nothing is removed.
    async fn list_trim_front(&self, key: &str, count: usize) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Overwrite a scalar and its expiry in one command.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set only when the key is absent, with an expiry. Returns whether the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete the key only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the expiry of an existing key. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete keys; absent keys are ignored. Returns how many were removed.
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    /// Enumerate keys matching a Redis-style glob (`*`, `?`, `[..]`, `\` escapes).
    /// Not a consistent snapshot.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;
}
