//! Key/value cache abstraction.
//!
//! The cache only ever holds point-in-time snapshots of relational data, so
//! every failure here is logged and swallowed: a broken cache degrades to
//! "always miss", never to a failed request.
//!
//! Reads are cache-aside: miss, query, then `set`. Writers invalidate after
//! they commit. A reader whose query ran before a concurrent commit can
//! still `set` its pre-commit snapshot after the writer's invalidation, and
//! that snapshot is served until the next invalidation of the key or until
//! its TTL runs out. The next write to the same rows clears it.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CacheError;

/// Cache key builders and TTLs.
pub mod keys {
    use std::time::Duration;

    /// TTL for a user's session list.
    pub const SESSIONS_LIST_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
    /// TTL for a session's message list and its history snapshots.
    pub const MESSAGES_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn messages_list(session_id: i64) -> String {
        format!("messages_list_{session_id}")
    }

    pub fn sessions_list(user_id: i64) -> String {
        format!("chat_sessions_list_{user_id}")
    }

    pub fn conversation_history(session_id: i64, limit: usize) -> String {
        format!("conversation_history_{session_id}:{limit}")
    }

    /// Matches every history snapshot of `session_id`, whatever the limit.
    pub fn conversation_history_pattern(session_id: i64) -> String {
        format!("conversation_history_{session_id}:*")
    }
}

/// A string key/value store with per-entry TTL.
#[async_trait]
pub trait CacheClient: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Delete every key matching `pattern`, where `*` matches any run of
    /// characters. A pattern without `*` deletes exactly that key.
    /// Returns the number of keys removed.
    async fn delete(&self, pattern: &str) -> Result<u64, CacheError>;
}

// ── best-effort helpers ──────────────────────────────────────────────────────

/// Read and decode a JSON value. Misses, backend errors and undecodable
/// entries all come back as `None`.
pub async fn get_json<T>(cache: &dyn CacheClient, key: &str) -> Option<T>
where
    T: DeserializeOwned,
{
    let raw = match cache.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            debug!(key, "cache miss");
            return None;
        }
        Err(e) => {
            warn!(key, error = %e, "cache read failed; falling back to store");
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => {
            debug!(key, "cache hit");
            Some(value)
        }
        Err(source) => {
            let e = CacheError::Codec {
                key: key.to_owned(),
                source,
            };
            warn!(error = %e, "discarding undecodable cache entry");
            None
        }
    }
}

/// Encode and store a JSON value, logging any failure.
pub async fn set_json<T>(cache: &dyn CacheClient, key: &str, value: &T, ttl: Duration)
where
    T: Serialize + ?Sized,
{
    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(source) => {
            let e = CacheError::Codec {
                key: key.to_owned(),
                source,
            };
            warn!(error = %e, "failed to encode cache entry");
            return;
        }
    };

    if let Err(e) = cache.set(key, &raw, ttl).await {
        warn!(key, error = %e, "cache write failed");
    }
}

/// Delete keys matching `pattern`, logging any failure.
pub async fn invalidate(cache: &dyn CacheClient, pattern: &str) {
    match cache.delete(pattern).await {
        Ok(removed) => debug!(pattern, removed, "cache invalidated"),
        Err(e) => warn!(pattern, error = %e, "cache invalidation failed"),
    }
}

// ── in-process implementation ────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process cache backed by a [`DashMap`].
///
/// Expired entries are dropped lazily on read and on pattern deletes.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Re-checked under the shard lock so a concurrent `set` survives.
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, pattern: &str) -> Result<u64, CacheError> {
        if !pattern.contains('*') {
            return Ok(self.entries.remove(pattern).map_or(0, |_| 1));
        }

        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            if glob_match(pattern, key) {
                if entry.expires_at > now {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

/// Glob match supporting only `*` (any run of characters, including none).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    // `split` always yields at least one item.
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No `*` at all: exact match.
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
