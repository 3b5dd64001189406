//! Task combinators built on the executor.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;

use crate::deferred::{Deferred, DeferredCell};
use crate::error::{Error, Result};
use crate::executor::join::join_all;
use crate::executor::task::Task;
use crate::executor;
use crate::local::LocalKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TableId {
    namespace: &'static str,
    key: TypeId,
    value: TypeId,
}

/// Memo tables for one run, one `HashMap<K, DeferredCell>` per
/// namespace, key type and value type.
#[derive(Default)]
struct Memo {
    tables: RefCell<HashMap<TableId, Box<dyn Any>>>,
}

static MEMO: LocalKey<Memo> = LocalKey::run_scoped(|_| Memo::default());

impl Memo {
    fn lookup<K: Hash + Eq + 'static>(&self, table: TableId, key: &K) -> Result<Option<DeferredCell>> {
        let tables = self.tables.borrow();
        let Some(entries) = tables.get(&table) else {
            return Ok(None);
        };
        let entries = entries
            .downcast_ref::<HashMap<K, DeferredCell>>()
            .ok_or(Error::TypeMismatch {
                expected: std::any::type_name::<HashMap<K, DeferredCell>>(),
            })?;
        Ok(entries.get(key).cloned())
    }

    fn insert<K: Hash + Eq + 'static>(&self, table: TableId, key: K, cell: DeferredCell) -> Result<()> {
        let mut tables = self.tables.borrow_mut();
        let entries = tables
            .entry(table)
            .or_insert_with(|| Box::new(HashMap::<K, DeferredCell>::new()))
            .downcast_mut::<HashMap<K, DeferredCell>>()
            .ok_or(Error::TypeMismatch {
                expected: std::any::type_name::<HashMap<K, DeferredCell>>(),
            })?;
        entries.insert(key, cell);
        Ok(())
    }
}

/// Runs `make` at most once per executor run for each `(namespace, key)`
/// and result type. Every caller, including ones that arrive while the first
/// computation is still in flight, receives the same value or error.
pub fn memoized<T, K, F>(namespace: &'static str, key: K, make: F) -> Task<T>
where
    T: Clone + 'static,
    K: Hash + Eq + 'static,
    F: FnOnce() -> Task<T> + 'static,
{
    Task::new(async move {
        let executor = executor::current()?;
        let memo = executor.local(&MEMO)?;
        let table = TableId {
            namespace,
            key: TypeId::of::<K>(),
            value: TypeId::of::<T>(),
        };
        let deferred = match memo.lookup(table, &key)? {
            Some(cell) => Deferred::<T>::from_cell(cell),
            None => {
                tracing::trace!(namespace, "memo miss");
                let deferred = executor.spawn(make());
                memo.insert(table, key, deferred.cell().clone())?;
                deferred
            }
        };
        deferred.await
    })
}

/// Applies `f` to every item and awaits the resulting tasks together.
/// Results keep input order.
pub fn map<T, U, F>(items: impl IntoIterator<Item = T>, f: F) -> Task<Vec<U>>
where
    U: Clone + 'static,
    F: FnMut(T) -> Task<U>,
{
    let tasks: Vec<Task<U>> = items.into_iter().map(f).collect();
    Task::new(async move { join_all(tasks).await })
}

/// Keeps the items whose predicate task resolves to true, in input order.
/// Predicates are evaluated together.
pub fn filter<T, P>(items: impl IntoIterator<Item = T>, mut predicate: P) -> Task<Vec<T>>
where
    T: 'static,
    P: FnMut(&T) -> Task<bool>,
{
    let items: Vec<T> = items.into_iter().collect();
    let checks: Vec<Task<bool>> = items.iter().map(&mut predicate).collect();
    Task::new(async move {
        let keep = join_all(checks).await?;
        Ok(items
            .into_iter()
            .zip(keep)
            .filter_map(|(item, keep)| keep.then_some(item))
            .collect())
    })
}
