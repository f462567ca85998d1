//! Result cache with a short-lived reservation key guarding against the
//! thundering-herd case where many identical submissions arrive before the
//! first one has produced a result: the first caller reserves the
//! fingerprint, later callers see the reservation and are enqueued as their
//! own task rather than waiting; [`ResultCache::peek`] gives the dispatch
//! path a way to notice, at its own dispatch turn, that the in-flight build
//! has since finished, so it can reuse that workflow instead of starting a
//! second one for the same fingerprint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use config_manager::CacheConfig;
use serde::{de::DeserializeOwned, Serialize};
use store::json_ext::KvStoreJsonExt;
use store::KvStore;

use crate::fingerprint::{cache_key, reservation_key};
use crate::types::Parameters;

/// A cached value that knows its own expiry, so [`ResultCache`] can enforce
/// `expiresAt < now` itself rather than trusting the store's TTL alone
/// (belt-and-braces per §4.3).
pub trait CacheEntry {
    fn expires_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// A cached result is ready to be returned directly.
    Hit,
    /// No result yet, and no other caller is currently computing one: the
    /// reservation was placed by this call and the caller owns it.
    Reserved,
    /// No result yet, but another caller already reserved this fingerprint.
    /// The caller should re-queue and poll rather than dispatch again.
    InFlight,
}

pub struct ResultCache {
    store: Arc<dyn KvStore>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    /// Read a cached result for `(task_type, parameters)` without touching
    /// the reservation. An entry whose `expires_at` has passed is treated as
    /// a miss and deleted, even if the store's own TTL hasn't evicted it yet.
    pub async fn peek<T>(&self, task_type: &str, parameters: &Parameters) -> anyhow::Result<Option<T>>
    where
        T: DeserializeOwned + CacheEntry,
    {
        let result_key = cache_key(task_type, parameters);
        if let Some(value) = self.store.get_json::<T>(&result_key).await? {
            if value.expires_at() > Utc::now() {
                return Ok(Some(value));
            }
            self.store.delete(&result_key).await?;
        }
        Ok(None)
    }

    /// Look up a cached result for `(task_type, parameters)`. If absent,
    /// attempt to take the reservation for it.
    pub async fn lookup_or_reserve<T>(
        &self,
        task_type: &str,
        parameters: &Parameters,
    ) -> anyhow::Result<(Lookup, Option<T>)>
    where
        T: DeserializeOwned + CacheEntry,
    {
        if let Some(value) = self.peek::<T>(task_type, parameters).await? {
            return Ok((Lookup::Hit, Some(value)));
        }

        let reservation = reservation_key(task_type, parameters);
        let acquired = self
            .store
            .set_if_absent(&reservation, b"1", Some(Duration::from_secs(self.config.reservation_ttl_seconds)))
            .await?;

        if acquired {
            Ok((Lookup::Reserved, None))
        } else {
            Ok((Lookup::InFlight, None))
        }
    }

    /// Store a computed result and release the reservation for it.
    pub async fn store_result<T>(&self, task_type: &str, parameters: &Parameters, value: &T) -> anyhow::Result<()>
    where
        T: Serialize,
    {
        let result_key = cache_key(task_type, parameters);
        self.store
            .set_json(&result_key, value, Some(Duration::from_secs(self.config.default_ttl_seconds)))
            .await?;
        self.store.delete(&reservation_key(task_type, parameters)).await?;
        Ok(())
    }

    /// Release a reservation without storing a result, e.g. because the
    /// underlying workflow failed and callers should be free to retry.
    pub async fn release_reservation(&self, task_type: &str, parameters: &Parameters) -> anyhow::Result<()> {
        self.store.delete(&reservation_key(task_type, parameters)).await?;
        Ok(())
    }

    /// Remove a single cached entry by its fingerprint key.
    pub async fn invalidate(&self, task_type: &str, parameters: &Parameters) -> anyhow::Result<()> {
        self.store.delete(&cache_key(task_type, parameters)).await?;
        Ok(())
    }

    /// Scan every cache entry, re-read it, and remove those whose stored
    /// `task_type` matches `type_name`. O(n) in cache size; there is no
    /// secondary index by type, so this is expected to be called rarely.
    pub async fn invalidate_by_type(&self, type_name: &str) -> anyhow::Result<u64> {
        let keys = self.store.scan_prefix("cache:workflow:").await?;
        let mut matched = Vec::new();
        for key in &keys {
            if let Some(value) = self.store.get_json::<serde_json::Value>(key).await? {
                if value.get("task_type").and_then(|v| v.as_str()) == Some(type_name) {
                    matched.push(key.clone());
                }
            }
        }
        if matched.is_empty() {
            return Ok(0);
        }
        let count = matched.len() as u64;
        self.store.delete_batch(&matched).await?;
        Ok(count)
    }

    /// Remove every cached entry. Pipelines the deletion when the batch is
    /// large, via the store adapter's own batching threshold.
    pub async fn clear(&self) -> anyhow::Result<()> {
        let keys = self.store.scan_prefix("cache:workflow:").await?;
        if keys.is_empty() {
            return Ok(());
        }
        self.store.delete_batch(&keys).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use store::fake::InMemoryStore;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct TestEntry {
        task_type: String,
        ok: bool,
        expires_at: DateTime<Utc>,
    }

    impl CacheEntry for TestEntry {
        fn expires_at(&self) -> DateTime<Utc> {
            self.expires_at
        }
    }

    fn entry(task_type: &str) -> TestEntry {
        TestEntry { task_type: task_type.to_string(), ok: true, expires_at: Utc::now() + chrono::Duration::hours(1) }
    }

    fn expired_entry(task_type: &str) -> TestEntry {
        TestEntry { task_type: task_type.to_string(), ok: true, expires_at: Utc::now() - chrono::Duration::seconds(1) }
    }

    fn empty_params() -> Parameters {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn first_caller_reserves_second_caller_sees_in_flight() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = ResultCache::new(store, CacheConfig::default());
        let params = empty_params();

        let (first, value) = cache.lookup_or_reserve::<TestEntry>("inference", &params).await.unwrap();
        assert_eq!(first, Lookup::Reserved);
        assert!(value.is_none());

        let (second, _) = cache.lookup_or_reserve::<TestEntry>("inference", &params).await.unwrap();
        assert_eq!(second, Lookup::InFlight);
    }

    #[tokio::test]
    async fn storing_a_result_clears_the_reservation_and_becomes_a_hit() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = ResultCache::new(store, CacheConfig::default());
        let params = empty_params();

        cache.lookup_or_reserve::<TestEntry>("inference", &params).await.unwrap();
        cache.store_result("inference", &params, &entry("inference")).await.unwrap();

        let (lookup, value) = cache.lookup_or_reserve::<TestEntry>("inference", &params).await.unwrap();
        assert_eq!(lookup, Lookup::Hit);
        assert_eq!(value.unwrap().task_type, "inference");
    }

    #[tokio::test]
    async fn releasing_a_reservation_lets_another_caller_take_it() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = ResultCache::new(store, CacheConfig::default());
        let params = empty_params();

        cache.lookup_or_reserve::<TestEntry>("inference", &params).await.unwrap();
        cache.release_reservation("inference", &params).await.unwrap();

        let (lookup, _) = cache.lookup_or_reserve::<TestEntry>("inference", &params).await.unwrap();
        assert_eq!(lookup, Lookup::Reserved);
    }

    #[tokio::test]
    async fn invalidate_removes_a_single_entry() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = ResultCache::new(store, CacheConfig::default());
        let params = empty_params();

        cache.store_result("inference", &params, &entry("inference")).await.unwrap();
        cache.invalidate("inference", &params).await.unwrap();

        let (lookup, _) = cache.lookup_or_reserve::<TestEntry>("inference", &params).await.unwrap();
        assert_eq!(lookup, Lookup::Reserved);
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_a_miss_and_removed() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = ResultCache::new(store, CacheConfig::default());
        let params = empty_params();

        cache.store_result("inference", &params, &expired_entry("inference")).await.unwrap();

        let (lookup, value) = cache.lookup_or_reserve::<TestEntry>("inference", &params).await.unwrap();
        assert_eq!(lookup, Lookup::Reserved);
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn invalidate_by_type_removes_only_matching_entries() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = ResultCache::new(store, CacheConfig::default());

        let mut inference_params = empty_params();
        inference_params.insert("model".into(), crate::types::ParamValue::String("resnet".into()));
        cache.store_result("inference", &inference_params, &entry("inference")).await.unwrap();

        let training_params = empty_params();
        cache.store_result("training", &training_params, &entry("training")).await.unwrap();

        let removed = cache.invalidate_by_type("inference").await.unwrap();
        assert_eq!(removed, 1);

        let (inference_lookup, _) =
            cache.lookup_or_reserve::<TestEntry>("inference", &inference_params).await.unwrap();
        assert_eq!(inference_lookup, Lookup::Reserved);

        let (training_lookup, _) =
            cache.lookup_or_reserve::<TestEntry>("training", &training_params).await.unwrap();
        assert_eq!(training_lookup, Lookup::Hit);
    }

    #[tokio::test]
    async fn invalidate_by_type_on_empty_cache_returns_zero() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = ResultCache::new(store, CacheConfig::default());
        assert_eq!(cache.invalidate_by_type("inference").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_removes_every_entry() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let cache = ResultCache::new(store, CacheConfig::default());

        cache.store_result("inference", &empty_params(), &entry("inference")).await.unwrap();
        cache.clear().await.unwrap();

        let (lookup, _) = cache.lookup_or_reserve::<TestEntry>("inference", &empty_params()).await.unwrap();
        assert_eq!(lookup, Lookup::Reserved);
    }
}
