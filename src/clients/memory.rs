//! In-process [`KvStore`] for tests and local runs.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;

use super::kv::KvStore;
use crate::error::{Error, Result};

/// Number of store calls per operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreCalls {
    pub get_multi: usize,
    pub set_multi: usize,
    pub delete_multi: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    data: RefCell<HashMap<String, (Vec<u8>, Option<Duration>)>>,
    rejected: RefCell<HashSet<String>>,
    failure: RefCell<Option<Error>>,
    last_get: RefCell<Vec<String>>,
    gets: Cell<usize>,
    sets: Cell<usize>,
    deletes: Cell<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: Vec<u8>) {
        self.data.borrow_mut().insert(key.into(), (value, None));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.borrow().contains_key(key)
    }

    /// TTL `key` was stored with, or `None` if the key is absent.
    pub fn ttl_of(&self, key: &str) -> Option<Option<Duration>> {
        self.data.borrow().get(key).map(|(_, ttl)| *ttl)
    }

    /// Makes every later set of `key` fail.
    pub fn reject(&self, key: impl Into<String>) {
        self.rejected.borrow_mut().insert(key.into());
    }

    /// Makes the next store call return `error`.
    pub fn fail_next(&self, error: Error) {
        *self.failure.borrow_mut() = Some(error);
    }

    pub fn calls(&self) -> StoreCalls {
        StoreCalls {
            get_multi: self.gets.get(),
            set_multi: self.sets.get(),
            delete_multi: self.deletes.get(),
        }
    }

    /// Keys requested by the most recent `get_multi`.
    pub fn last_get_keys(&self) -> Vec<String> {
        self.last_get.borrow().clone()
    }

    fn enter(&self, counter: &Cell<usize>) -> Result<()> {
        counter.set(counter.get() + 1);
        match self.failure.borrow_mut().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl KvStore for MemoryStore {
    fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        self.enter(&self.gets)?;
        *self.last_get.borrow_mut() = keys.to_vec();
        let data = self.data.borrow();
        Ok(keys
            .iter()
            .filter_map(|key| Some((key.clone(), data.get(key)?.0.clone())))
            .collect())
    }

    fn set_multi(&self, items: &[(String, Vec<u8>)], ttl: Option<Duration>) -> Result<Vec<String>> {
        self.enter(&self.sets)?;
        let rejected = self.rejected.borrow();
        let mut data = self.data.borrow_mut();
        let mut failed = Vec::new();
        for (key, value) in items {
            if rejected.contains(key) {
                failed.push(key.clone());
            } else {
                data.insert(key.clone(), (value.clone(), ttl));
            }
        }
        Ok(failed)
    }

    fn delete_multi(&self, keys: &[String]) -> Result<()> {
        self.enter(&self.deletes)?;
        let mut data = self.data.borrow_mut();
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }
}
