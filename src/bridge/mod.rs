//! Bridge from externally scheduled work into the executor.
//!
//! [`watch`] pairs a [`Deferred`] that lives on the scheduler thread with a
//! `Send` [`Completer`] that travels to whatever runs the work: a worker
//! pool, a plain thread, a tokio runtime. Completers push outcomes into a
//! mailbox guarded by a mutex and signal a condition variable. A drain hook
//! on the scheduler side blocks on that condition variable, collects every
//! finished outcome under the lock, resolves the matching deferreds after
//! releasing it, and registers itself again while work is outstanding.
//!
//! The mailbox is the only state touched from other threads.

mod thread_pool;

pub use thread_pool::{Job, ThreadPool, ThreadPoolConfig, ThreadPoolError, ThreadPoolStats};

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::deferred::{Deferred, DeferredCell};
use crate::error::{Error, Result};
use crate::executor::task::{Task, Value};
use crate::executor::{self, Executor};
use crate::hook::{self, HookId};
use crate::local::LocalKey;
use crate::priority::Priority;
use crate::telemetry::StatEvent;

type Payload = Result<Box<dyn Any + Send>>;

#[derive(Default)]
struct Mailbox {
    finished: VecDeque<(u64, Payload)>,
    outstanding: HashSet<u64>,
}

#[derive(Default)]
struct MailboxShared {
    mailbox: Mutex<Mailbox>,
    ready: Condvar,
}

/// Sending half of one unit of external work.
///
/// Dropping it without calling [`Completer::complete`] resolves the paired
/// deferred with [`Error::Abandoned`].
pub struct Completer<T> {
    id: u64,
    shared: Arc<MailboxShared>,
    done: bool,
    _value: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Completer<T> {
    pub fn complete(mut self, result: Result<T>) {
        self.deliver(result.map(|value| Box::new(value) as Box<dyn Any + Send>));
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: Error) {
        self.complete(Err(error));
    }
}

impl<T> Completer<T> {
    fn deliver(&mut self, payload: Payload) {
        self.done = true;
        {
            let mut mailbox = self.shared.mailbox.lock();
            mailbox.outstanding.remove(&self.id);
            mailbox.finished.push_back((self.id, payload));
        }
        self.shared.ready.notify_one();
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.done {
            self.deliver(Err(Error::Abandoned));
        }
    }
}

struct Bridge {
    shared: Arc<MailboxShared>,
    waiting: RefCell<HashMap<u64, DeferredCell>>,
    next_id: Cell<u64>,
    hook: HookId,
    priority: Priority,
}

static BRIDGE: LocalKey<Bridge> = LocalKey::run_scoped(Bridge::initialize);

impl Bridge {
    fn initialize(executor: &Executor) -> Self {
        Self {
            shared: Arc::new(MailboxShared::default()),
            waiting: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            hook: HookId::unique(),
            priority: executor.config().bridge_hook_priority,
        }
    }

    fn track(&self, cell: DeferredCell) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.shared.mailbox.lock().outstanding.insert(id);
        self.waiting.borrow_mut().insert(id, cell);
        id
    }

    fn arm(&self, executor: &Executor) -> Result<()> {
        hook::register_on(executor, self.priority, self.hook, check_back)?;
        Ok(())
    }

    /// Blocks until something finished or nothing is outstanding, then takes
    /// every finished outcome.
    fn collect(&self) -> (Vec<(u64, Payload)>, usize) {
        let mut mailbox = self.shared.mailbox.lock();
        while mailbox.finished.is_empty() && !mailbox.outstanding.is_empty() {
            self.shared.ready.wait(&mut mailbox);
        }
        let finished = mailbox.finished.drain(..).collect();
        (finished, mailbox.outstanding.len())
    }
}

fn check_back() -> Task<()> {
    Task::new(async {
        let executor = executor::current()?;
        let bridge = executor.local(&BRIDGE)?;
        let (finished, outstanding) = bridge.collect();
        tracing::debug!(
            executor = executor.id(),
            finished = finished.len(),
            outstanding,
            "bridge check-back"
        );
        executor.record(StatEvent::BridgeCompleted {
            count: finished.len(),
        });

        for (id, payload) in finished {
            let Some(cell) = bridge.waiting.borrow_mut().remove(&id) else {
                continue;
            };
            let outcome = payload.map(|boxed| {
                let boxed: Box<dyn Any> = boxed;
                Value::from(boxed)
            });
            if cell.resolve(outcome).is_err() {
                tracing::warn!(unit = id, "bridged deferred was resolved elsewhere");
            }
        }
        if outstanding > 0 {
            bridge.arm(&executor)?;
        }
        Ok(())
    })
}

/// Registers one unit of external work on the current executor.
pub fn watch<T: Send + 'static>() -> Result<(Deferred<T>, Completer<T>)> {
    let executor = executor::current()?;
    let bridge = executor.local(&BRIDGE)?;
    let deferred = Deferred::new();
    let id = bridge.track(deferred.cell().clone());
    bridge.arm(&executor)?;
    let completer = Completer {
        id,
        shared: Arc::clone(&bridge.shared),
        done: false,
        _value: PhantomData,
    };
    Ok((deferred, completer))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn guarded<T>(job: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|panic| Err(Error::Panicked(panic_message(panic))))
}

/// Runs a blocking `job` on `pool`.
pub fn submit<T, F>(pool: &ThreadPool, job: F) -> Result<Deferred<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (deferred, completer) = watch()?;
    pool.execute(move || completer.complete(guarded(job)))?;
    Ok(deferred)
}

/// Runs a blocking `job` on a dedicated thread.
pub fn spawn_thread<T, F>(job: F) -> Result<Deferred<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (deferred, completer) = watch()?;
    std::thread::Builder::new()
        .name("batchloop-bridge".to_string())
        .spawn(move || completer.complete(guarded(job)))
        .map_err(|e| ThreadPoolError::ThreadSpawnFailed(e.to_string()))?;
    Ok(deferred)
}

/// Runs `future` on a tokio runtime.
pub fn spawn_async<T, F>(runtime: &tokio::runtime::Handle, future: F) -> Result<Deferred<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let (deferred, completer) = watch()?;
    // A panic inside `future` drops the completer, which reports Abandoned.
    let _detached = runtime.spawn(async move { completer.complete(future.await) });
    Ok(deferred)
}

/// Task that runs `job` on `pool` and resolves with its result.
pub fn offload<T, F>(pool: Rc<ThreadPool>, job: F) -> Task<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    Task::new(async move { submit(&pool, job)?.await })
}
