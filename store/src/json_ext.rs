use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{KvStore, StoreError};

/// Convenience layer over [`KvStore`] for the JSON-shaped values every other
/// component actually stores (`Task`, cached results, predictions, events).
#[async_trait]
pub trait KvStoreJsonExt: KvStore {
    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StoreError::Internal(format!("serialize {key}: {e}")))?;
        self.set(key, bytes, ttl).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Internal(format!("deserialize {key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl<T: KvStore + ?Sized> KvStoreJsonExt for T {}
