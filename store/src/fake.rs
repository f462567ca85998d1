//! In-memory [`KvStore`] used by the rest of the workspace's test suites so
//! they can exercise queue scheduling, caching and autoscaling logic without
//! a live Redis instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{KvStore, ScoredMember, StoreError};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Clone, Copy)]
struct ZMember {
    score: f64,
    seq: u64,
}

#[derive(Default)]
pub struct InMemoryStore {
    values: DashMap<String, Entry>,
    zsets: DashMap<String, Mutex<Vec<(String, ZMember)>>>,
    hashes: DashMap<String, DashMap<String, Vec<u8>>>,
    seq: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.values.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool, StoreError> {
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        match self.values.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    value: value.to_vec(),
                    expires_at: ttl.map(|d| Instant::now() + d),
                });
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(entry) = self.values.get(key) {
            if let Some(expires_at) = entry.expires_at {
                if Instant::now() >= expires_at {
                    drop(entry);
                    self.values.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.values.remove(key);
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let seq = self.next_seq();
        let set = self.zsets.entry(key.to_string()).or_default();
        let mut guard = set.lock();
        if let Some(existing) = guard.iter_mut().find(|(m, _)| m == member) {
            existing.1 = ZMember { score, seq };
        } else {
            guard.push((member.to_string(), ZMember { score, seq }));
        }
        Ok(())
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<ScoredMember>, StoreError> {
        let Some(set) = self.zsets.get(key) else {
            return Ok(None);
        };
        let mut guard = set.lock();
        if guard.is_empty() {
            return Ok(None);
        }
        let min_idx = guard
            .iter()
            .enumerate()
            .min_by(|(_, (_, a)), (_, (_, b))| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|(idx, _)| idx)
            .expect("non-empty");
        let (member, zmember) = guard.remove(min_idx);
        Ok(Some(ScoredMember {
            member,
            score: zmember.score,
        }))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(set) = self.zsets.get(key) {
            set.lock().retain(|(m, _)| m != member);
        }
        Ok(())
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let Some(set) = self.zsets.get(key) else {
            return Ok(0);
        };
        let guard = set.lock();
        Ok(guard
            .iter()
            .filter(|(_, z)| z.score >= min && z.score <= max)
            .count() as u64)
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|h| h.get(field).map(|v| v.clone())))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.iter().map(|e| (e.key().clone(), e.value().clone())).collect())
            .unwrap_or_default())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .values
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}
