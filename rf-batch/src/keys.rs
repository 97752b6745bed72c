//! Sender identity and the store key layout derived from it.

use crate::error::{BatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

pub const DEFAULT_KEY_PREFIX: &str = "rapidfire";

/// Canonical digits-only sender identifier. Every producer and every poller
/// must derive it through [`SenderKey::normalize`] or one sender's fragments
/// end up in two unrelated batches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderKey(String);

impl SenderKey {
    /// Accepts phone numbers in any common written form (`+7 (900) 123-45-67`,
    /// `8 900 123 45 67`) and chat addresses such as `79001234567@c.us`.
    pub fn normalize(raw: &str) -> Result<Self> {
        let local = raw.trim().split('@').next().unwrap_or_default();
        let mut digits: String = local.chars().filter(char::is_ascii_digit).collect();
        if digits.len() == 11 && digits.starts_with('8') {
            digits.replace_range(..1, "7");
        }
        if digits.is_empty() {
            return Err(BatchError::InvalidSender(raw.to_string()));
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Deref for SenderKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for SenderKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for SenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store key namespace. One sender owns three keys: the pending fragment
/// list, the last-activity marker and the drain claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim().trim_end_matches(':');
        Self {
            prefix: if prefix.is_empty() {
                DEFAULT_KEY_PREFIX.to_string()
            } else {
                prefix.to_string()
            },
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn batch_key(&self, sender: &SenderKey) -> String {
        format!("{}:batch:{sender}", self.prefix)
    }

    pub fn marker_key(&self, sender: &SenderKey) -> String {
        format!("{}:last:{sender}", self.prefix)
    }

    pub fn claim_key(&self, sender: &SenderKey) -> String {
        format!("{}:claim:{sender}", self.prefix)
    }

    /// Store glob over every batch key. Glob syntax in the prefix is escaped.
    pub fn batch_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.prefix.len() + 8);
        for c in self.prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push_str(":batch:*");
        pattern
    }

    /// Recover the sender from a key returned by a batch-pattern scan.
    pub fn sender_from_batch_key(&self, key: &str) -> Option<SenderKey> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix(":batch:")?;
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(SenderKey(rest.to_string()))
    }
}
