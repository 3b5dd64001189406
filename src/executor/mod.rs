//! Single-threaded cooperative executor.
//!
//! Tasks live in an arena keyed by [`TaskId`]. Stepping a task either
//! finishes it or yields a dependency [`Bundle`]; the executor schedules the
//! bundle's units and requeues the task once every unit resolved, or as soon
//! as one of them failed. Completion continuations refer to the waiting task
//! by id and generation only, so a completion that arrives after the task
//! moved on is recognised as stale and dropped.
//!
//! When the run queue empties while tasks are still pending the executor
//! emits [`Event::QueueExhausted`]; the hook drain reacts by injecting work.
//! If nothing becomes runnable the run fails with [`Error::Deadlock`].

pub mod bundle;
pub mod events;
pub mod join;
pub mod task;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{self, RuntimeConfig};
use crate::deferred::{Deferred, DeferredCell, Outcome};
use crate::error::{Error, Result};
use crate::local::{LocalId, LocalKey};
use crate::telemetry::{RunStats, StatEvent, StatsSnapshot};

use bundle::{Bundle, Partial, Slot, Unit};
use events::{Event, Signal, Subscription};
use task::{downcast, BoxComputation, Resume, Step, Task};

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Vec<Executor>> = const { RefCell::new(Vec::new()) };
}

/// Identity of a task within one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Where a finished task's outcome goes.
enum Continuation {
    Root(Rc<RefCell<Option<Outcome>>>),
    Parent {
        id: TaskId,
        generation: u64,
        slot: Slot,
    },
    Deferred(DeferredCell),
    Callback(Box<dyn FnOnce(Outcome)>),
    Detached(&'static str),
}

struct TaskSlot {
    /// Taken out while the task is being stepped.
    computation: Option<BoxComputation>,
    generation: u64,
    started: bool,
    partial: Option<Partial>,
    remaining: usize,
    failure: Option<Error>,
    queued: bool,
    continuation: Continuation,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskSlot>,
    run_queue: VecDeque<TaskId>,
    next_task: u64,
    locals: HashMap<LocalId, Rc<dyn Any>>,
    /// Locals dropped when the current run ends.
    run_scoped: HashSet<LocalId>,
}

pub(crate) struct Shared {
    id: u64,
    config: RuntimeConfig,
    state: RefCell<State>,
    running: Cell<bool>,
    iteration: Signal,
    exhausted: Signal,
    stats: RunStats,
}

impl Shared {
    pub(crate) fn signal(&self, event: Event) -> &Signal {
        match event {
            Event::Iteration => &self.iteration,
            Event::QueueExhausted => &self.exhausted,
        }
    }
}

/// Handle to an executor. Clones refer to the same executor.
#[derive(Clone)]
pub struct Executor {
    shared: Rc<Shared>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.shared.id)
            .field("pending", &self.pending())
            .field("running", &self.shared.running.get())
            .finish()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

/// Pops the current-executor stack and clears the running flag on exit.
struct Entered<'a> {
    shared: &'a Shared,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        CURRENT.with(|stack| stack.borrow_mut().pop());
        self.shared.running.set(false);
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Builds an executor configured from `BATCHLOOP_*` variables.
    pub fn from_env() -> Self {
        Self::with_config(config::load())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            shared: Rc::new(Shared {
                id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: RefCell::new(State::default()),
                running: Cell::new(false),
                iteration: Signal::default(),
                exhausted: Signal::default(),
                stats: RunStats::default(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Number of tasks that have not finished.
    pub fn pending(&self) -> usize {
        self.shared.state.borrow().tasks.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub(crate) fn record(&self, event: StatEvent) {
        self.shared.stats.record(event);
    }

    pub fn subscribe(&self, event: Event, listener: impl FnMut() + 'static) -> Subscription {
        let id = self.shared.signal(event).connect(listener);
        Subscription::new(Rc::downgrade(&self.shared), event, id)
    }

    pub fn on_iteration(&self, listener: impl FnMut() + 'static) -> Subscription {
        self.subscribe(Event::Iteration, listener)
    }

    pub fn on_queue_exhausted(&self, listener: impl FnMut() + 'static) -> Subscription {
        self.subscribe(Event::QueueExhausted, listener)
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Rc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(shared: &Weak<Shared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    /// Runs `task` and every task it spawns to completion, then returns the
    /// root task's outcome.
    pub fn run<T: Clone + 'static>(&self, task: Task<T>) -> Result<T> {
        if self.shared.running.replace(true) {
            return Err(Error::Usage("executor is already running"));
        }
        CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
        let _entered = Entered {
            shared: &self.shared,
        };
        let span = tracing::debug_span!("executor.run", executor = self.shared.id);
        let _span = span.enter();

        let root = Rc::new(RefCell::new(None));
        self.schedule_computation(
            task.into_computation(),
            Continuation::Root(Rc::clone(&root)),
        );
        let driven = self.drive();
        self.teardown();
        driven?;

        let outcome = root
            .borrow_mut()
            .take()
            .ok_or(Error::Usage("root task did not finish"))?;
        outcome.and_then(downcast::<T>)
    }

    fn drive(&self) -> Result<()> {
        while self.pending() > 0 {
            self.record(StatEvent::Iteration);
            self.shared.iteration.emit();
            self.drain();

            if self.pending() > 0 && self.runnable() == 0 {
                self.record(StatEvent::QueueExhausted);
                self.shared.exhausted.emit();
                if self.runnable() == 0 {
                    let pending = self.pending();
                    tracing::error!(
                        executor = self.shared.id,
                        pending,
                        "run queue exhausted with nothing left to inject"
                    );
                    return Err(Error::Deadlock { pending });
                }
            }
        }
        Ok(())
    }

    fn runnable(&self) -> usize {
        self.shared.state.borrow().run_queue.len()
    }

    fn drain(&self) {
        loop {
            let next = self.shared.state.borrow_mut().run_queue.pop_front();
            match next {
                Some(id) => self.step(id),
                None => break,
            }
        }
    }

    fn step(&self, id: TaskId) {
        let prepared = {
            let mut state = self.shared.state.borrow_mut();
            let Some(task) = state.tasks.get_mut(&id) else {
                return;
            };
            task.queued = false;
            let Some(computation) = task.computation.take() else {
                return;
            };
            task.generation += 1;
            let input = if !task.started {
                task.started = true;
                Resume::Start
            } else if let Some(error) = task.failure.take() {
                task.partial = None;
                Resume::Raise(error)
            } else {
                match task.partial.take().map(Partial::assemble) {
                    Some(Ok(resolved)) => Resume::Ready(resolved),
                    Some(Err(error)) => Resume::Raise(error),
                    None => Resume::Raise(Error::Usage("task resumed without a pending bundle")),
                }
            };
            (computation, input)
        };
        let (mut computation, input) = prepared;

        tracing::trace!(task = %id, "step");
        match computation.resume(input) {
            Step::Suspend(bundle) => self.suspend(id, computation, bundle),
            Step::Done(value) => {
                drop(computation);
                self.finish(id, Ok(value));
            }
            Step::Failed(error) => {
                drop(computation);
                self.finish(id, Err(error));
            }
        }
    }

    fn suspend(&self, id: TaskId, computation: BoxComputation, bundle: Bundle) {
        let (partial, units) = bundle.split();
        let generation = {
            let mut state = self.shared.state.borrow_mut();
            let Some(task) = state.tasks.get_mut(&id) else {
                return;
            };
            task.computation = Some(computation);
            task.partial = Some(partial);
            task.remaining = units.len();
            task.failure = None;
            task.generation
        };

        if units.is_empty() {
            self.make_runnable(id);
            return;
        }
        for (slot, unit) in units {
            match unit {
                Unit::Task(child) => {
                    self.schedule_computation(
                        child,
                        Continuation::Parent {
                            id,
                            generation,
                            slot,
                        },
                    );
                }
                Unit::Deferred(cell) => {
                    let shared = self.downgrade();
                    cell.subscribe(Box::new(move |outcome| {
                        if let Some(executor) = Executor::upgrade(&shared) {
                            executor.complete_dependency(id, generation, slot, outcome.clone());
                        }
                    }));
                }
            }
        }
    }

    fn complete_dependency(&self, parent: TaskId, generation: u64, slot: Slot, outcome: Outcome) {
        let ready = {
            let mut state = self.shared.state.borrow_mut();
            let Some(task) = state.tasks.get_mut(&parent) else {
                return;
            };
            if task.generation != generation {
                tracing::trace!(task = %parent, generation, "discarding stale completion");
                return;
            }
            let Some(partial) = task.partial.as_mut() else {
                return;
            };
            match outcome {
                Ok(value) => {
                    if task.failure.is_some() {
                        return;
                    }
                    if partial.fill(&slot, value) {
                        task.remaining = task.remaining.saturating_sub(1);
                    }
                    task.remaining == 0
                }
                Err(error) => {
                    task.failure = Some(error);
                    true
                }
            }
        };
        if ready {
            self.make_runnable(parent);
        }
    }

    fn finish(&self, id: TaskId, outcome: Outcome) {
        let Some(task) = self.shared.state.borrow_mut().tasks.remove(&id) else {
            return;
        };
        self.record(if outcome.is_ok() {
            StatEvent::TaskSucceeded
        } else {
            StatEvent::TaskFailed
        });

        match task.continuation {
            Continuation::Root(cell) => *cell.borrow_mut() = Some(outcome),
            Continuation::Parent {
                id: parent,
                generation,
                slot,
            } => self.complete_dependency(parent, generation, slot, outcome),
            Continuation::Deferred(cell) => {
                if cell.resolve(outcome).is_err() {
                    tracing::warn!(task = %id, "spawned task's deferred was resolved elsewhere");
                }
            }
            Continuation::Callback(callback) => callback(outcome),
            Continuation::Detached(label) => {
                if let Err(error) = outcome {
                    tracing::warn!(task = %id, label, %error, "detached task failed");
                }
            }
        }
    }

    fn schedule_computation(&self, computation: BoxComputation, continuation: Continuation) -> TaskId {
        let id = {
            let mut state = self.shared.state.borrow_mut();
            state.next_task += 1;
            let id = TaskId(state.next_task);
            state.tasks.insert(
                id,
                TaskSlot {
                    computation: Some(computation),
                    generation: 0,
                    started: false,
                    partial: None,
                    remaining: 0,
                    failure: None,
                    queued: true,
                    continuation,
                },
            );
            state.run_queue.push_back(id);
            id
        };
        self.record(StatEvent::TaskScheduled);
        id
    }

    /// Registers `task` and routes its outcome to one of two callbacks.
    pub fn schedule<T: Clone + 'static>(
        &self,
        task: Task<T>,
        on_done: impl FnOnce(T) + 'static,
        on_error: impl FnOnce(Error) + 'static,
    ) -> TaskId {
        let continuation = Continuation::Callback(Box::new(move |outcome: Outcome| {
            match outcome.and_then(downcast::<T>) {
                Ok(value) => on_done(value),
                Err(error) => on_error(error),
            }
        }));
        self.schedule_computation(task.into_computation(), continuation)
    }

    /// Schedules independent work and returns a handle to its outcome.
    pub fn spawn<T: 'static>(&self, task: Task<T>) -> Deferred<T> {
        let deferred = Deferred::new();
        self.schedule_computation(
            task.into_computation(),
            Continuation::Deferred(deferred.cell().clone()),
        );
        deferred
    }

    /// Schedules work whose outcome nobody waits for. Failures are logged.
    pub(crate) fn spawn_detached(&self, task: Task<()>, label: &'static str) -> TaskId {
        self.schedule_computation(task.into_computation(), Continuation::Detached(label))
    }

    /// Queues a task whose dependencies are all satisfied. Returns false if
    /// the task is unknown, already queued or still waiting.
    pub fn make_runnable(&self, id: TaskId) -> bool {
        let mut state = self.shared.state.borrow_mut();
        let State {
            tasks, run_queue, ..
        } = &mut *state;
        let Some(task) = tasks.get_mut(&id) else {
            return false;
        };
        if task.queued || task.computation.is_none() {
            return false;
        }
        if task.failure.is_none() && task.remaining > 0 {
            return false;
        }
        task.queued = true;
        run_queue.push_back(id);
        true
    }

    /// Returns this executor's value for `key`, initializing it on first use.
    pub fn local<T: 'static>(&self, key: &LocalKey<T>) -> Result<Rc<T>> {
        let id = key.id();
        let existing = self.shared.state.borrow().locals.get(&id).cloned();
        let value = match existing {
            Some(value) => value,
            None => {
                // No borrow is held while the initializer runs.
                let fresh: Rc<dyn Any> = Rc::new(key.initialize(self));
                let mut state = self.shared.state.borrow_mut();
                if key.is_run_scoped() {
                    state.run_scoped.insert(id);
                }
                Rc::clone(state.locals.entry(id).or_insert(fresh))
            }
        };
        value.downcast::<T>().map_err(|_| Error::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })
    }

    /// Replaces this executor's value for `key`.
    pub fn set_local<T: 'static>(&self, key: &LocalKey<T>, value: T) {
        let id = key.id();
        let previous = {
            let mut state = self.shared.state.borrow_mut();
            if key.is_run_scoped() {
                state.run_scoped.insert(id);
            }
            state.locals.insert(id, Rc::new(value))
        };
        drop(previous);
    }

    /// Drops unfinished tasks and run-scoped locals. Open batch groups,
    /// pending hooks and bridge registrations live in run-scoped locals, so
    /// none of them reach the next run.
    fn teardown(&self) {
        let (tasks, queue, scoped) = {
            let mut state = self.shared.state.borrow_mut();
            let State {
                tasks,
                run_queue,
                locals,
                run_scoped,
                ..
            } = &mut *state;
            let scoped: Vec<Rc<dyn Any>> = run_scoped
                .drain()
                .filter_map(|id| locals.remove(&id))
                .collect();
            (std::mem::take(tasks), std::mem::take(run_queue), scoped)
        };
        if !tasks.is_empty() {
            tracing::debug!(
                executor = self.shared.id,
                abandoned = tasks.len(),
                "dropping unfinished tasks"
            );
        }
        // Values may hold subscriptions or tasks; drop them with no borrow held.
        drop(queue);
        drop(tasks);
        drop(scoped);
    }
}

/// The innermost executor currently running on this thread.
pub fn current() -> Result<Executor> {
    try_current().ok_or(Error::Usage("no active executor"))
}

pub fn try_current() -> Option<Executor> {
    CURRENT.with(|stack| stack.borrow().last().cloned())
}

/// Schedules `task` on the current executor.
pub fn spawn<T: 'static>(task: Task<T>) -> Result<Deferred<T>> {
    Ok(current()?.spawn(task))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_returns_root_value() {
        let executor = Executor::new();
        assert_eq!(executor.run(Task::ready(5u32)).unwrap(), 5);
        assert_eq!(executor.pending(), 0);
        assert!(!executor.is_running());
    }

    #[test]
    fn test_current_is_set_only_while_running() {
        assert!(try_current().is_none());
        let executor = Executor::new();
        let id = executor
            .run(Task::new(async { Ok(current()?.id()) }))
            .unwrap();
        assert_eq!(id, executor.id());
        assert!(try_current().is_none());
    }

    #[test]
    fn test_run_is_not_reentrant() {
        let executor = Executor::new();
        let inner = executor.clone();
        let result = executor.run(Task::new(async move { inner.run(Task::ready(1u8)) }));
        assert!(matches!(result, Err(Error::Usage(_))));
    }

    #[test]
    fn test_schedule_routes_outcomes() {
        let executor = Executor::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let ok = Rc::clone(&seen);
        let err = Rc::clone(&seen);
        executor.schedule(
            Task::ready(3u32),
            move |value| ok.borrow_mut().push(format!("ok {value}")),
            |_| unreachable!(),
        );
        executor.schedule(
            Task::<u32>::fail(Error::msg("nope")),
            |_| unreachable!(),
            move |error| err.borrow_mut().push(format!("err {error}")),
        );
        executor.run(Task::ready(())).unwrap();
        assert_eq!(*seen.borrow(), vec!["ok 3", "err nope"]);
    }

    #[test]
    fn test_make_runnable_rejects_waiting_task() {
        let executor = Executor::new();
        let handle = executor.clone();
        let result = executor.run(Task::new(async move {
            let gate = Deferred::<()>::new();
            let waiting = handle.spawn(Task::new({
                let gate = gate.clone();
                async move { gate.await }
            }));
            // The spawned task has not run yet and is already queued.
            assert!(!handle.make_runnable(TaskId(2)));
            gate.set_value(())?;
            waiting.await
        }));
        assert!(result.is_ok());
    }

    #[test]
    fn test_stats_count_iterations_and_tasks() {
        let executor = Executor::new();
        executor
            .run(Task::new(async {
                let value = Task::ready(1u8).await?;
                Ok(value)
            }))
            .unwrap();
        let stats = executor.stats();
        assert_eq!(stats.tasks_scheduled, 2);
        assert_eq!(stats.tasks_succeeded, 2);
        assert!(stats.iterations >= 1);
    }
}
