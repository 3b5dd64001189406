//! Manually resolved, single-assignment result cells.

use std::cell::RefCell;
use std::fmt;
use std::future::IntoFuture;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::executor::task::{downcast, Awaiting, Task, Value};
use crate::executor::{self, bundle::Unit};

pub(crate) type Outcome = Result<Value>;

type Waiter = Box<dyn FnOnce(&Outcome)>;

enum CellState {
    Unset(Vec<Waiter>),
    Resolved(Outcome),
}

/// Untyped shared slot behind every [`Deferred`].
#[derive(Clone)]
pub struct DeferredCell(Rc<RefCell<CellState>>);

impl DeferredCell {
    pub(crate) fn new() -> Self {
        Self(Rc::new(RefCell::new(CellState::Unset(Vec::new()))))
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(&*self.0.borrow(), CellState::Resolved(_))
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        match &*self.0.borrow() {
            CellState::Resolved(outcome) => Some(outcome.clone()),
            CellState::Unset(_) => None,
        }
    }

    /// Resolves the cell and notifies waiters outside of the borrow.
    pub(crate) fn resolve(&self, outcome: Outcome) -> Result<()> {
        let waiters = {
            let mut state = self.0.borrow_mut();
            match &mut *state {
                CellState::Resolved(_) => return Err(Error::AlreadyResolved),
                CellState::Unset(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = CellState::Resolved(outcome.clone());
                    waiters
                }
            }
        };
        for waiter in waiters {
            waiter(&outcome);
        }
        Ok(())
    }

    /// Runs `waiter` at resolution, or right away if already resolved.
    pub(crate) fn subscribe(&self, waiter: Waiter) {
        let outcome = {
            let mut state = self.0.borrow_mut();
            match &mut *state {
                CellState::Unset(waiters) => {
                    waiters.push(waiter);
                    return;
                }
                CellState::Resolved(outcome) => outcome.clone(),
            }
        };
        waiter(&outcome);
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A result slot resolved exactly once, by hand or by a spawned task.
///
/// Awaiting a `Deferred` inside a task suspends until it resolves. Awaiting
/// one that is already resolved returns its outcome in place, without
/// suspending the task.
pub struct Deferred<T> {
    cell: DeferredCell,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("ready", &self.cell.is_ready())
            .finish()
    }
}

impl<T: 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    pub(crate) fn cell(&self) -> &DeferredCell {
        &self.cell
    }

    pub(crate) fn from_cell(cell: DeferredCell) -> Self {
        Self {
            cell,
            _value: PhantomData,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.cell.is_ready()
    }

    pub fn set_error(&self, error: Error) -> Result<()> {
        self.cell.resolve(Err(error))
    }

    /// True if both handles refer to the same cell.
    pub fn same_as(&self, other: &Self) -> bool {
        self.cell.ptr_eq(&other.cell)
    }
}

impl<T: 'static> Deferred<T> {
    pub fn new() -> Self {
        Self::from_cell(DeferredCell::new())
    }

    pub fn set_value(&self, value: T) -> Result<()> {
        self.cell.resolve(Ok(Rc::new(value)))
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// Returns the resolved value, or the error it was resolved with.
    pub fn get(&self) -> Result<T> {
        match self.cell.outcome() {
            Some(outcome) => outcome.and_then(downcast::<T>),
            None => Err(Error::NotResolved),
        }
    }

    /// Calls `callback` once with the outcome. Fires immediately if the
    /// deferred is already resolved.
    pub fn on_ready(&self, callback: impl FnOnce(Result<T>) + 'static) {
        self.cell.subscribe(Box::new(move |outcome| {
            callback(outcome.clone().and_then(downcast::<T>))
        }));
    }
}

impl<T: Clone + 'static> IntoFuture for Deferred<T> {
    type Output = Result<T>;
    type IntoFuture = Awaiting<T>;

    fn into_future(self) -> Awaiting<T> {
        Awaiting::new(Unit::Deferred(self.cell))
    }
}

impl<T: Clone + 'static> IntoFuture for &Deferred<T> {
    type Output = Result<T>;
    type IntoFuture = Awaiting<T>;

    fn into_future(self) -> Awaiting<T> {
        Awaiting::new(Unit::Deferred(self.cell.clone()))
    }
}

/// Schedules `task` on the current executor and returns a handle to its
/// outcome. The task runs whether or not the handle is ever awaited.
pub fn future<T: 'static>(task: Task<T>) -> Result<Deferred<T>> {
    executor::spawn(task)
}

/// Waits until at least `count` handles (all of them when `None`) are
/// resolved, with a value or an error.
///
/// Returns the resolved handles: those already resolved on entry first, in
/// input order, then those resolved during the wait, in completion order.
pub async fn wait<T: 'static>(handles: &[Deferred<T>], count: Option<usize>) -> Result<Vec<Deferred<T>>> {
    let count = count.unwrap_or(handles.len());
    if count > handles.len() {
        return Err(Error::WaitCountExceeded {
            requested: count,
            available: handles.len(),
        });
    }

    let (mut resolved, pending): (Vec<_>, Vec<_>) =
        handles.iter().cloned().partition(Deferred::is_ready);
    if resolved.len() >= count {
        return Ok(resolved);
    }

    let needed = count - resolved.len();
    let gate = Deferred::<()>::new();
    let completed: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    for (index, handle) in pending.iter().enumerate() {
        let gate = gate.clone();
        let completed = Rc::clone(&completed);
        handle.cell.subscribe(Box::new(move |_| {
            let mut completed = completed.borrow_mut();
            completed.push(index);
            if completed.len() == needed {
                drop(completed);
                // Only this subscription can reach `needed`.
                let _ = gate.set_value(());
            }
        }));
    }
    gate.await?;

    resolved.extend(completed.borrow().iter().map(|&index| pending[index].clone()));
    Ok(resolved)
}
