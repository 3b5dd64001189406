//! Batched key-value client.
//!
//! Gets, sets and deletes issued through one [`BatchKvClient`] within a drain
//! window reach the store as one multi-key call per operation. Sets are
//! grouped by TTL.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use crate::batch::Batcher;
use crate::error::Result;
use crate::executor::join::join_all;
use crate::executor::task::Task;

/// A key-value backend with multi-key operations.
pub trait KvStore {
    fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>>;

    /// Stores every item. Returns the keys that could not be stored.
    fn set_multi(&self, items: &[(String, Vec<u8>)], ttl: Option<Duration>) -> Result<Vec<String>>;

    fn delete_multi(&self, keys: &[String]) -> Result<()>;
}

impl<S: KvStore + ?Sized> KvStore for Rc<S> {
    fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        (**self).get_multi(keys)
    }

    fn set_multi(&self, items: &[(String, Vec<u8>)], ttl: Option<Duration>) -> Result<Vec<String>> {
        (**self).set_multi(items, ttl)
    }

    fn delete_multi(&self, keys: &[String]) -> Result<()> {
        (**self).delete_multi(keys)
    }
}

struct Inner<S> {
    store: S,
    prefix: String,
}

impl<S: KvStore> Inner<S> {
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn unique_keys(&self, keys: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        keys.iter()
            .map(|key| self.full_key(key))
            .filter(|key| seen.insert(key.clone()))
            .collect()
    }

    fn get_batch(&self, keys: Vec<String>) -> Result<Vec<Option<Vec<u8>>>> {
        let unique = self.unique_keys(&keys);
        tracing::debug!(calls = keys.len(), keys = unique.len(), "kv get_multi");
        let found = self.store.get_multi(&unique)?;
        Ok(keys
            .iter()
            .map(|key| found.get(&self.full_key(key)).cloned())
            .collect())
    }

    fn set_batch(&self, items: Vec<SetCall>) -> Result<Vec<bool>> {
        let mut by_ttl: BTreeMap<Option<Duration>, BTreeMap<String, Vec<u8>>> = BTreeMap::new();
        for item in &items {
            by_ttl
                .entry(item.ttl)
                .or_default()
                .insert(self.full_key(&item.key), item.value.clone());
        }

        let mut failed = HashSet::new();
        for (ttl, entries) in by_ttl {
            let entries: Vec<(String, Vec<u8>)> = entries.into_iter().collect();
            tracing::debug!(keys = entries.len(), ?ttl, "kv set_multi");
            failed.extend(self.store.set_multi(&entries, ttl)?);
        }
        if !failed.is_empty() {
            tracing::warn!(failed = failed.len(), "kv store rejected keys");
        }
        Ok(items
            .iter()
            .map(|item| !failed.contains(&self.full_key(&item.key)))
            .collect())
    }

    fn delete_batch(&self, keys: Vec<String>) -> Result<Vec<()>> {
        let unique = self.unique_keys(&keys);
        tracing::debug!(calls = keys.len(), keys = unique.len(), "kv delete_multi");
        self.store.delete_multi(&unique)?;
        Ok(vec![(); keys.len()])
    }
}

#[derive(Clone)]
struct SetCall {
    key: String,
    value: Vec<u8>,
    ttl: Option<Duration>,
}

/// Coalescing client over a [`KvStore`].
///
/// Each operation batches per client instance: clones of one client share
/// batches, separately constructed clients never do.
pub struct BatchKvClient<S> {
    inner: Rc<Inner<S>>,
    gets: Batcher<String, Option<Vec<u8>>>,
    sets: Batcher<SetCall, bool>,
    deletes: Batcher<String, ()>,
}

impl<S> Clone for BatchKvClient<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            gets: self.gets.clone(),
            sets: self.sets.clone(),
            deletes: self.deletes.clone(),
        }
    }
}

impl<S: KvStore + 'static> BatchKvClient<S> {
    pub fn new(store: S) -> Self {
        Self::with_prefix(store, "")
    }

    /// Client that prepends `prefix` to every key it sends to the store.
    pub fn with_prefix(store: S, prefix: impl Into<String>) -> Self {
        let inner = Rc::new(Inner {
            store,
            prefix: prefix.into(),
        });

        let gets = {
            let inner = Rc::clone(&inner);
            Batcher::named("kv.get", move |keys: Vec<String>| {
                Task::new(std::future::ready(inner.get_batch(keys)))
            })
        };
        let sets = {
            let inner = Rc::clone(&inner);
            Batcher::named("kv.set", move |items: Vec<SetCall>| {
                Task::new(std::future::ready(inner.set_batch(items)))
            })
        };
        let deletes = {
            let inner = Rc::clone(&inner);
            Batcher::named("kv.delete", move |keys: Vec<String>| {
                Task::new(std::future::ready(inner.delete_batch(keys)))
            })
        };

        Self {
            gets: gets.owned_by(&*inner),
            sets: sets.owned_by(&*inner),
            deletes: deletes.owned_by(&*inner),
            inner,
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Value under `key`, or `None` if the store has none.
    pub fn get(&self, key: impl Into<String>) -> Task<Option<Vec<u8>>> {
        self.gets.call(key.into())
    }

    /// Values for every key the store has, keyed without the prefix.
    pub fn get_many<K: Into<String>>(&self, keys: impl IntoIterator<Item = K>) -> Task<HashMap<String, Vec<u8>>> {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let lookups: Vec<Task<Option<Vec<u8>>>> = keys.iter().map(|key| self.get(key.clone())).collect();
        Task::new(async move {
            let values = join_all(lookups).await?;
            Ok(keys
                .into_iter()
                .zip(values)
                .filter_map(|(key, value)| Some((key, value?)))
                .collect())
        })
    }

    /// Stores `value` under `key`. Resolves false if the store rejected it.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Vec<u8>>, ttl: Option<Duration>) -> Task<bool> {
        self.sets.call(SetCall {
            key: key.into(),
            value: value.into(),
            ttl,
        })
    }

    pub fn delete(&self, key: impl Into<String>) -> Task<()> {
        self.deletes.call(key.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::MemoryStore;
    use crate::error::Error;
    use crate::executor::Executor;

    #[test]
    fn test_gets_coalesce_and_dedupe() {
        let store = Rc::new(MemoryStore::new());
        store.insert("a", b"1".to_vec());
        store.insert("b", b"2".to_vec());
        let client = BatchKvClient::new(Rc::clone(&store));
        let values = Executor::new()
            .run(Task::new(async move {
                join_all([client.get("a"), client.get("b"), client.get("a"), client.get("zz")]).await
            }))
            .unwrap();
        assert_eq!(
            values,
            vec![Some(b"1".to_vec()), Some(b"2".to_vec()), Some(b"1".to_vec()), None]
        );
        assert_eq!(store.calls().get_multi, 1);
        assert_eq!(store.last_get_keys(), vec!["a", "b", "zz"]);
    }

    #[test]
    fn test_prefix_is_transparent() {
        let store = Rc::new(MemoryStore::new());
        store.insert("app:x", b"ex".to_vec());
        let client = BatchKvClient::with_prefix(Rc::clone(&store), "app:");
        let found = Executor::new()
            .run(Task::new(async move {
                client.set("y", "why", None).await?;
                client.get_many(["x", "y", "missing"]).await
            }))
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["x"], b"ex".to_vec());
        assert_eq!(found["y"], b"why".to_vec());
        assert!(store.contains("app:y"));
    }

    #[test]
    fn test_sets_grouped_by_ttl() {
        let store = Rc::new(MemoryStore::new());
        store.reject("bad");
        let client = BatchKvClient::new(Rc::clone(&store));
        let stored = Executor::new()
            .run(Task::new(async move {
                join_all([
                    client.set("a", "1", None),
                    client.set("b", "2", Some(Duration::from_secs(60))),
                    client.set("bad", "3", None),
                    client.set("c", "4", Some(Duration::from_secs(60))),
                ])
                .await
            }))
            .unwrap();
        assert_eq!(stored, vec![true, true, false, true]);
        assert_eq!(store.calls().set_multi, 2);
        assert_eq!(store.ttl_of("c"), Some(Some(Duration::from_secs(60))));
        assert_eq!(store.ttl_of("a"), Some(None));
    }

    #[test]
    fn test_separate_clients_batch_separately() {
        let store = Rc::new(MemoryStore::new());
        let first = BatchKvClient::new(Rc::clone(&store));
        let second = BatchKvClient::new(Rc::clone(&store));
        let shared = first.clone();
        Executor::new()
            .run(Task::new(async move {
                join_all([first.delete("a"), shared.delete("b"), second.delete("c")]).await?;
                Ok(())
            }))
            .unwrap();
        assert_eq!(store.calls().delete_multi, 2);
    }

    #[test]
    fn test_store_failure_reaches_every_caller() {
        let store = Rc::new(MemoryStore::new());
        store.fail_next(Error::msg("connection reset"));
        let client = BatchKvClient::new(Rc::clone(&store));
        let outcome = Executor::new().run(Task::new(async move {
            crate::join((client.get("a"), client.get("b"))).await
        }));
        assert!(matches!(outcome, Err(Error::Failed(_))));
        assert_eq!(store.calls().get_multi, 1);
    }
}
