//! Key-value store adapter.
//!
//! Thin contract over an external ordered-set + hash + key-value store, used
//! by every other component in the coordinator. Keys are colon-separated
//! namespaces (`task:<id>`, `queue:<priority>`, `cache:workflow:<fingerprint>`,
//! ...); the adapter itself knows nothing about those namespaces, it only
//! moves bytes.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod redis_store;
pub mod json_ext;

#[cfg(feature = "test-util")]
pub mod fake;

pub use json_ext::KvStoreJsonExt;
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// A single ordered-set member and its score, as returned by `zpop_min`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Contract every backing store (Redis today, anything conforming tomorrow)
/// must satisfy. All other components depend only on this trait.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set a byte value, optionally with a TTL. Overwrites any existing value.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set a byte value only if the key does not already exist, optionally
    /// with a TTL. Returns whether this call was the one that set it.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool, StoreError>;

    /// Get a byte value. Returns `None` if the key does not exist or has expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a single key. Idempotent: deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete many keys in one round trip (pipelined when the backend supports it).
    async fn delete_batch(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Add (or update) a member's score in an ordered set.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Remove and return the minimum-scored member, if any.
    async fn zpop_min(&self, key: &str) -> Result<Option<ScoredMember>, StoreError>;

    /// Remove a specific member from an ordered set, regardless of score.
    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Count members whose score falls within `[min, max]`.
    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;

    /// Set a field within a hash.
    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Get a field within a hash.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Get every field/value pair within a hash.
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// List every key matching `prefix*`. Uses a cursor-based scan rather than
    /// a blocking keyspace listing, so it is safe to call against a live store.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
