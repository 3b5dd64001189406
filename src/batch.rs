//! Call coalescing.
//!
//! Calls submitted under the same [`BatchKey`] between two drains are
//! collected into one group. When the run queue drains, the highest-priority
//! group across all keys is handed to its batched function in a single call,
//! and result `i` resolves caller `i`'s deferred. A failure, or a result list
//! of the wrong length, is delivered to every caller in the group.

use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};

use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::executor::task::Task;
use crate::executor::{self, Executor};
use crate::hook::{self, HookId};
use crate::local::LocalKey;
use crate::priority::{Priority, PriorityQueue, DEFAULT_PRIORITY};
use crate::telemetry::StatEvent;

/// A function that serves many calls at once. It must return exactly one
/// result per payload, in payload order.
pub type BatchFn<P, R> = Rc<dyn Fn(Vec<P>) -> Task<Vec<R>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FunctionId {
    Type(TypeId),
    Named(&'static str),
    Instance(usize),
}

/// Identifies which calls may be coalesced: the batched function, and
/// optionally the instance that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey {
    function: FunctionId,
    owner: Option<usize>,
}

impl BatchKey {
    /// Key identifying `function` by its type. Every closure expression and
    /// every `fn` item has a distinct type, but closures built by one factory
    /// share theirs whatever they capture; key those per instance.
    pub fn of<F: 'static>(_function: &F) -> Self {
        Self {
            function: FunctionId::Type(TypeId::of::<F>()),
            owner: None,
        }
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            function: FunctionId::Named(name),
            owner: None,
        }
    }

    /// Key identifying one shared function object by its address.
    pub fn instance<F: ?Sized>(function: &Rc<F>) -> Self {
        Self {
            function: FunctionId::Instance(Rc::as_ptr(function) as *const () as usize),
            owner: None,
        }
    }

    /// Coalesce separately per `owner` instance, identified by address.
    pub fn owned_by<O: ?Sized>(self, owner: &O) -> Self {
        self.with_owner(owner as *const O as *const () as usize)
    }

    pub fn with_owner(mut self, owner: usize) -> Self {
        self.owner = Some(owner);
        self
    }
}

trait PendingGroup {
    fn len(&self) -> usize;

    fn dispatch(self: Box<Self>, key: BatchKey) -> LocalBoxFuture<'static, Result<()>>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Group<P, R> {
    batched: BatchFn<P, R>,
    payloads: Vec<P>,
    sinks: Vec<Deferred<R>>,
}

impl<P: 'static, R: Clone + 'static> PendingGroup for Group<P, R> {
    fn len(&self) -> usize {
        self.sinks.len()
    }

    fn dispatch(self: Box<Self>, key: BatchKey) -> LocalBoxFuture<'static, Result<()>> {
        let Group {
            batched,
            payloads,
            sinks,
        } = *self;
        async move {
            let expected = sinks.len();
            let outcome = match batched(payloads).await {
                Ok(results) if results.len() == expected => Ok(results),
                Ok(results) => {
                    tracing::error!(
                        ?key,
                        expected,
                        actual = results.len(),
                        "batched function returned the wrong number of results"
                    );
                    Err(Error::BatchSizeMismatch {
                        expected,
                        actual: results.len(),
                    })
                }
                Err(error) => Err(error),
            };

            let delivered = match outcome {
                Ok(results) => sinks
                    .iter()
                    .zip(results)
                    .map(|(sink, result)| sink.set_value(result))
                    .filter(Result::is_err)
                    .count(),
                Err(error) => sinks
                    .iter()
                    .map(|sink| sink.set_error(error.clone()))
                    .filter(Result::is_err)
                    .count(),
            };
            if delivered > 0 {
                tracing::warn!(?key, skipped = delivered, "batch result sinks were resolved elsewhere");
            }
            Ok(())
        }
        .boxed_local()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
struct Coalescer {
    groups: RefCell<HashMap<BatchKey, Box<dyn PendingGroup>>>,
    queue: RefCell<PriorityQueue<BatchKey>>,
}

static COALESCER: LocalKey<Coalescer> = LocalKey::run_scoped(|_| Coalescer::default());

impl Coalescer {
    /// Adds a call to the open group for `key`. Returns true if this call
    /// opened a new group.
    fn enqueue<P: 'static, R: Clone + 'static>(
        &self,
        key: BatchKey,
        batched: BatchFn<P, R>,
        priority: Priority,
        payload: P,
        sink: Deferred<R>,
    ) -> Result<bool> {
        let mut groups = self.groups.borrow_mut();
        if let Some(group) = groups.get_mut(&key) {
            let group = group
                .as_any_mut()
                .downcast_mut::<Group<P, R>>()
                .ok_or(Error::TypeMismatch {
                    expected: type_name::<Group<P, R>>(),
                })?;
            group.payloads.push(payload);
            group.sinks.push(sink);
            return Ok(false);
        }
        groups.insert(
            key,
            Box::new(Group {
                batched,
                payloads: vec![payload],
                sinks: vec![sink],
            }),
        );
        self.queue.borrow_mut().push(key, priority);
        Ok(true)
    }

    fn take_next(&self) -> Option<(BatchKey, Box<dyn PendingGroup>)> {
        loop {
            let key = self.queue.borrow_mut().pop()?;
            if let Some(group) = self.groups.borrow_mut().remove(&key) {
                return Some((key, group));
            }
        }
    }
}

fn dispatch_next() -> Task<()> {
    Task::new(async {
        let executor = executor::current()?;
        let next = executor.local(&COALESCER)?.take_next();
        let Some((key, group)) = next else {
            return Ok(());
        };
        let size = group.len();
        tracing::debug!(executor = executor.id(), ?key, size, "dispatching batch");
        executor.record(StatEvent::BatchDispatched { size });
        group.dispatch(key).await
    })
}

fn submit_on<P: 'static, R: Clone + 'static>(
    executor: &Executor,
    key: BatchKey,
    batched: BatchFn<P, R>,
    priority: Priority,
    payload: P,
) -> Result<Deferred<R>> {
    let sink = Deferred::new();
    let opened = executor
        .local(&COALESCER)?
        .enqueue(key, batched, priority, payload, sink.clone())?;
    if opened {
        hook::register_on(executor, priority, HookId::unique(), dispatch_next)?;
    }
    Ok(sink)
}

/// Adds one call to the batch for `key` on the current executor.
///
/// `batched` is only used if this call opens a new group; calls sharing a
/// key are expected to share the function.
pub fn submit<P, R, F>(key: BatchKey, batched: F, priority: Priority, payload: P) -> Result<Deferred<R>>
where
    P: 'static,
    R: Clone + 'static,
    F: Fn(Vec<P>) -> Task<Vec<R>> + 'static,
{
    submit_on(&executor::current()?, key, Rc::new(batched), priority, payload)
}

/// A batched function bound to its key and priority.
///
/// ```no_run
/// use batchloop::{batch::Batcher, Task};
///
/// let increment = Batcher::<u32, u32>::named("increment", |values: Vec<u32>| {
///     Task::new(async move { Ok(values.into_iter().map(|v| v + 1).collect()) })
/// });
/// let total = batchloop::run(Task::new(async move {
///     let (a, b) = batchloop::join((increment.call(1), increment.call(2))).await?;
///     Ok(a + b)
/// }));
/// ```
pub struct Batcher<P, R> {
    key: BatchKey,
    priority: Priority,
    batched: BatchFn<P, R>,
}

impl<P, R> Clone for Batcher<P, R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            priority: self.priority,
            batched: Rc::clone(&self.batched),
        }
    }
}

impl<P: 'static, R: Clone + 'static> Batcher<P, R> {
    /// Batches calls made through this batcher and its clones. Separately
    /// built batchers never share a group.
    pub fn new<F>(batched: F) -> Self
    where
        F: Fn(Vec<P>) -> Task<Vec<R>> + 'static,
    {
        let batched: BatchFn<P, R> = Rc::new(batched);
        Self {
            key: BatchKey::instance(&batched),
            priority: DEFAULT_PRIORITY,
            batched,
        }
    }

    pub fn named<F>(name: &'static str, batched: F) -> Self
    where
        F: Fn(Vec<P>) -> Task<Vec<R>> + 'static,
    {
        Self {
            key: BatchKey::named(name),
            priority: DEFAULT_PRIORITY,
            batched: Rc::new(batched),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn owned_by<O: ?Sized>(mut self, owner: &O) -> Self {
        self.key = self.key.owned_by(owner);
        self
    }

    pub fn key(&self) -> BatchKey {
        self.key
    }

    /// Adds `payload` to the open batch and returns its result handle.
    pub fn submit(&self, payload: P) -> Result<Deferred<R>> {
        submit_on(
            &executor::current()?,
            self.key,
            Rc::clone(&self.batched),
            self.priority,
            payload,
        )
    }

    /// A task that submits `payload` when it first runs and resolves with
    /// this call's share of the batch result.
    pub fn call(&self, payload: P) -> Task<R> {
        let batcher = self.clone();
        Task::new(async move { batcher.submit(payload)?.await })
    }
}
