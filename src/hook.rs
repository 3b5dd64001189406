//! Drain-time hooks.
//!
//! A hook is a one-shot callback that runs when the executor's run queue is
//! empty but tasks are still pending. Each queue exhaustion fires exactly one
//! hook, the highest-priority one, as a new task; ordinary task processing
//! resumes as soon as that task makes something runnable. A hook that leaves
//! more work behind must register itself again.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::executor::events::Subscription;
use crate::executor::task::Task;
use crate::executor::{self, Executor};
use crate::local::LocalKey;
use crate::priority::{Priority, PriorityQueue};
use crate::telemetry::StatEvent;

static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity used to de-duplicate pending hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(Repr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Repr {
    Unique(u64),
    Keyed(u64),
}

impl HookId {
    /// An identity no other hook shares.
    pub fn unique() -> Self {
        Self(Repr::Unique(NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed)))
    }

    /// A stable identity derived from `key`; equal keys collapse into one
    /// pending hook.
    pub fn from_key(key: impl Hash) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Self(Repr::Keyed(hasher.finish()))
    }
}

type HookFn = Box<dyn FnOnce() -> Task<()>>;

struct HookDrain {
    queue: RefCell<PriorityQueue<HookId>>,
    callbacks: RefCell<HashMap<HookId, HookFn>>,
    _exhausted: Subscription,
}

static DRAIN: LocalKey<HookDrain> = LocalKey::run_scoped(HookDrain::initialize);

impl HookDrain {
    fn initialize(executor: &Executor) -> Self {
        let shared = executor.downgrade();
        let exhausted = executor.on_queue_exhausted(move || {
            if let Some(executor) = Executor::upgrade(&shared) {
                fire_next(&executor);
            }
        });
        Self {
            queue: RefCell::new(PriorityQueue::new()),
            callbacks: RefCell::new(HashMap::new()),
            _exhausted: exhausted,
        }
    }

    fn add(&self, priority: Priority, id: HookId, callback: HookFn) -> bool {
        let mut callbacks = self.callbacks.borrow_mut();
        if callbacks.contains_key(&id) {
            return false;
        }
        callbacks.insert(id, callback);
        self.queue.borrow_mut().push(id, priority);
        true
    }

    fn pop(&self) -> Option<(HookId, HookFn)> {
        let id = self.queue.borrow_mut().pop()?;
        let callback = self.callbacks.borrow_mut().remove(&id)?;
        Some((id, callback))
    }
}

fn fire_next(executor: &Executor) {
    let Ok(drain) = executor.local(&DRAIN) else {
        return;
    };
    let Some((id, callback)) = drain.pop() else {
        return;
    };
    let waiting = drain.queue.borrow().len();
    tracing::debug!(executor = executor.id(), hook = ?id, waiting, "firing drain hook");
    executor.record(StatEvent::HookFired);
    executor.spawn_detached(callback(), "hook");
}

/// Registers a hook on `executor`. Returns false if a hook with the same
/// identity is already pending, in which case `callback` is dropped.
pub fn register_on(
    executor: &Executor,
    priority: Priority,
    id: HookId,
    callback: impl FnOnce() -> Task<()> + 'static,
) -> Result<bool> {
    Ok(executor.local(&DRAIN)?.add(priority, id, Box::new(callback)))
}

/// Registers a hook on the current executor.
pub fn register(
    priority: Priority,
    id: HookId,
    callback: impl FnOnce() -> Task<()> + 'static,
) -> Result<bool> {
    register_on(&executor::current()?, priority, id, callback)
}

/// Number of hooks waiting on the current executor.
pub fn pending() -> Result<usize> {
    let drain = executor::current()?.local(&DRAIN)?;
    let count = drain.callbacks.borrow().len();
    Ok(count)
}
