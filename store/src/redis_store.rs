use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};

use crate::{KvStore, ScoredMember, StoreError};

/// Redis-backed implementation of [`KvStore`].
///
/// Uses [`ConnectionManager`] so a dropped connection is transparently
/// re-established instead of poisoning every subsequent call; `SCAN` (not
/// `KEYS`) is used for prefix listings so a large keyspace never blocks the
/// server, and batched deletes are issued as a single pipeline.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let conn = client.get_connection_manager().await.map_err(map_err)?;
        Ok(Self { conn })
    }
}

fn map_err(err: RedisError) -> StoreError {
    if err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Internal(err.to_string())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                let _: () = conn.set_ex(key, value, secs).await.map_err(map_err)?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(map_err)?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut opts = redis::SetOptions::default().conditional_set(redis::ExistenceCheck::NX);
        if let Some(ttl) = ttl {
            opts = opts.with_expiration(redis::SetExpiry::EX(ttl.as_secs().max(1) as usize));
        }
        let result: Option<String> = conn.set_options(key, value, opts).await.map_err(map_err)?;
        Ok(result.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(map_err)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(map_err)?;
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        if keys.len() >= 20 {
            let mut pipe = redis::pipe();
            for key in keys {
                pipe.del(key).ignore();
            }
            let _: () = pipe.query_async(&mut conn).await.map_err(map_err)?;
        } else {
            let _: () = conn.del(keys).await.map_err(map_err)?;
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await.map_err(map_err)?;
        Ok(())
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<ScoredMember>, StoreError> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(key, 1).await.map_err(map_err)?;
        Ok(popped
            .into_iter()
            .next()
            .map(|(member, score)| ScoredMember { member, score }))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(key, member).await.map_err(map_err)?;
        Ok(())
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.zcount(key, min, max).await.map_err(map_err)?;
        Ok(count)
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await.map_err(map_err)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.hget(key, field).await.map_err(map_err)?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, Vec<u8>)> = conn.hgetall(key).await.map_err(map_err)?;
        Ok(entries)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(map_err)?;
        use futures::StreamExt;
        while let Some(key) = iter.next().await {
            keys.push(key);
        }
        Ok(keys)
    }
}
