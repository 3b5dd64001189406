//! Per-executor local storage.
//!
//! A [`LocalKey`] names one storage site. Each executor holds its own value
//! for the key, created by the key's initializer the first time the key is
//! touched on that executor and dropped with the executor. Nested and
//! sequential executors never see each other's values.
//!
//! Keys built with [`LocalKey::run_scoped`] are cleared when a run ends, so
//! the next run of the same executor starts from a fresh value. Plain keys
//! keep their value across runs.

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::error::Result;
use crate::executor::{self, Executor};

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Registration id of a storage site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(u64);

/// Issues a fresh, monotonically increasing registration id.
pub fn declare() -> LocalId {
    LocalId(NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed))
}

/// A storage site, usually held in a `static`.
///
/// ```
/// use batchloop::local::LocalKey;
///
/// static HITS: LocalKey<std::cell::Cell<u32>> = LocalKey::new(|_| Default::default());
/// ```
pub struct LocalKey<T: 'static> {
    id: OnceLock<LocalId>,
    init: fn(&Executor) -> T,
    run_scoped: bool,
}

impl<T: 'static> LocalKey<T> {
    pub const fn new(init: fn(&Executor) -> T) -> Self {
        Self {
            id: OnceLock::new(),
            init,
            run_scoped: false,
        }
    }

    /// A key whose value is dropped at the end of every run.
    pub const fn run_scoped(init: fn(&Executor) -> T) -> Self {
        Self {
            id: OnceLock::new(),
            init,
            run_scoped: true,
        }
    }

    pub fn is_run_scoped(&self) -> bool {
        self.run_scoped
    }

    /// Registration id, declared on first use.
    pub fn id(&self) -> LocalId {
        *self.id.get_or_init(declare)
    }

    pub(crate) fn initialize(&self, executor: &Executor) -> T {
        (self.init)(executor)
    }

    /// Value for the current executor.
    pub fn get(&self) -> Result<Rc<T>> {
        executor::current()?.local(self)
    }

    /// Replaces the value for the current executor.
    pub fn set(&self, value: T) -> Result<()> {
        executor::current()?.set_local(self, value);
        Ok(())
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let value = self.get()?;
        Ok(f(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::executor::task::Task;
    use std::cell::Cell;

    static COUNTER: LocalKey<Cell<u32>> = LocalKey::new(|_| Cell::new(0));

    thread_local! {
        static INITS: Cell<u32> = const { Cell::new(0) };
    }

    static TRACKED: LocalKey<u32> = LocalKey::new(|_| {
        INITS.with(|inits| inits.set(inits.get() + 1));
        7
    });

    #[test]
    fn test_declare_is_monotonic() {
        let first = declare();
        let second = declare();
        assert!(second > first);
    }

    #[test]
    fn test_key_id_is_stable() {
        assert_eq!(COUNTER.id(), COUNTER.id());
        assert_ne!(COUNTER.id(), TRACKED.id());
    }

    #[test]
    fn test_access_without_executor_fails() {
        assert!(matches!(COUNTER.get(), Err(Error::Usage(_))));
        assert!(matches!(COUNTER.set(Cell::new(1)), Err(Error::Usage(_))));
    }

    #[test]
    fn test_initializer_runs_once_per_executor() {
        INITS.with(|inits| inits.set(0));
        let executor = Executor::new();
        let total = executor
            .run(Task::new(async {
                let a = *TRACKED.get()?;
                let b = *TRACKED.get()?;
                Ok(a + b)
            }))
            .unwrap();
        assert_eq!(total, 14);
        assert_eq!(INITS.with(Cell::get), 1);

        Executor::new()
            .run(Task::new(async { TRACKED.with(|v| *v) }))
            .unwrap();
        assert_eq!(INITS.with(Cell::get), 2);
    }

    #[test]
    fn test_values_survive_between_runs_of_one_executor() {
        let executor = Executor::new();
        for _ in 0..3 {
            executor
                .run(Task::new(async {
                    COUNTER.with(|count| count.set(count.get() + 1))
                }))
                .unwrap();
        }
        let count = executor.local(&COUNTER).unwrap().get();
        assert_eq!(count, 3);
    }

    static PER_RUN: LocalKey<Cell<u32>> = LocalKey::run_scoped(|_| Cell::new(0));

    #[test]
    fn test_run_scoped_values_reset_between_runs() {
        let executor = Executor::new();
        let seen: Vec<u32> = (0..3)
            .map(|_| {
                executor
                    .run(Task::new(async {
                        PER_RUN.with(|count| {
                            count.set(count.get() + 1);
                            count.get()
                        })
                    }))
                    .unwrap()
            })
            .collect();
        assert_eq!(seen, vec![1, 1, 1]);
        assert!(PER_RUN.is_run_scoped());
        assert!(!COUNTER.is_run_scoped());
    }

    #[test]
    fn test_set_replaces_value() {
        let executor = Executor::new();
        let value = executor
            .run(Task::new(async {
                TRACKED.set(40)?;
                Ok(*TRACKED.get()? + 2)
            }))
            .unwrap();
        assert_eq!(value, 42);
    }
}
