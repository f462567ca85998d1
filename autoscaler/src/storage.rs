//! The store trait has no native list type, so bounded, ordered logs
//! (prediction history, HPA event lists) are kept as a single JSON array per
//! key and rewritten whole on each append. Volumes here are small (capped at
//! 100/1000 entries) so a read-modify-write round trip is cheap enough.

use serde::de::DeserializeOwned;
use serde::Serialize;
use store::json_ext::KvStoreJsonExt;
use store::KvStore;

/// Append `item` to the JSON array at `key`, dropping the oldest entries once
/// the list exceeds `cap`.
pub async fn append_capped<T>(store: &dyn KvStore, key: &str, item: T, cap: usize) -> anyhow::Result<()>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    let mut list = store.get_json::<Vec<T>>(key).await?.unwrap_or_default();
    list.push(item);
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(0..excess);
    }
    store.set_json(key, &list, None).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::fake::InMemoryStore;

    #[tokio::test]
    async fn append_capped_drops_oldest_once_over_cap() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            append_capped(&store, "k", i, 3).await.unwrap();
        }
        let list = store.get_json::<Vec<i32>>("k").await.unwrap().unwrap();
        assert_eq!(list, vec![2, 3, 4]);
    }
}
