//! Suspendable computations.
//!
//! A [`Computation`] is an explicit state machine stepped by the executor.
//! [`Task`] wraps one together with the type of the value it produces, and
//! can be built from an `async` block: the block is polled with a no-op
//! waker and communicates with the executor through thread-local slots.

use std::any::{type_name, Any};
use std::cell::RefCell;
use std::future::{Future, IntoFuture};
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::executor::bundle::{Bundle, Resolved, Unit};

/// Type-erased result value passed between tasks.
pub type Value = Rc<dyn Any>;

/// Input delivered to a computation when it is stepped.
pub enum Resume {
    /// First step.
    Start,
    /// The awaited bundle resolved.
    Ready(Resolved),
    /// A dependency failed; raise it at the suspension point.
    Raise(Error),
}

/// What a computation did with one step.
pub enum Step {
    Suspend(Bundle),
    Done(Value),
    Failed(Error),
}

/// A resumable unit of work.
pub trait Computation {
    fn resume(&mut self, input: Resume) -> Step;
}

pub(crate) type BoxComputation = Box<dyn Computation>;

/// Extracts a typed value, cloning only if the value is shared.
pub fn downcast<T: Clone + 'static>(value: Value) -> Result<T> {
    match value.downcast::<T>() {
        Ok(rc) => Ok(Rc::unwrap_or_clone(rc)),
        Err(_) => Err(Error::TypeMismatch {
            expected: type_name::<T>(),
        }),
    }
}

/// A computation producing a `T`.
pub struct Task<T> {
    inner: BoxComputation,
    _output: PhantomData<fn() -> T>,
}

impl<T: 'static> Task<T> {
    /// Adapts an `async` block into a task.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + 'static,
    {
        Self {
            inner: Box::new(AsyncComputation::new(future)),
            _output: PhantomData,
        }
    }

    /// Wraps a hand-written state machine. Its `Done` values must hold a `T`.
    pub fn from_computation(computation: impl Computation + 'static) -> Self {
        Self::from_boxed(Box::new(computation))
    }

    pub fn ready(value: T) -> Self {
        Self::new(async move { Ok(value) })
    }

    pub fn fail(error: Error) -> Self {
        Self::new(async move { Err(error) })
    }

    pub(crate) fn from_boxed(inner: BoxComputation) -> Self {
        Self {
            inner,
            _output: PhantomData,
        }
    }

    pub(crate) fn into_computation(self) -> BoxComputation {
        self.inner
    }
}

impl<T: Clone + 'static> IntoFuture for Task<T> {
    type Output = Result<T>;
    type IntoFuture = Awaiting<T>;

    fn into_future(self) -> Awaiting<T> {
        Awaiting::new(Unit::Task(self.inner))
    }
}

thread_local! {
    static YIELDED: RefCell<Option<Bundle>> = const { RefCell::new(None) };
    static RESUMED: RefCell<Option<Resume>> = const { RefCell::new(None) };
}

/// Hands a dependency bundle to the executor and waits for its results.
///
/// Only meaningful inside a computation driven by an executor.
pub fn suspend(bundle: Bundle) -> Suspend {
    Suspend {
        bundle: Some(bundle),
    }
}

/// Future returned by [`suspend`].
pub struct Suspend {
    bundle: Option<Bundle>,
}

impl Future for Suspend {
    type Output = Result<Resolved>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(bundle) = this.bundle.take() {
            let busy = YIELDED.with(|slot| {
                let mut slot = slot.borrow_mut();
                if slot.is_some() {
                    return true;
                }
                *slot = Some(bundle);
                false
            });
            if busy {
                return Poll::Ready(Err(Error::Usage(
                    "a computation may only await one bundle at a time",
                )));
            }
            return Poll::Pending;
        }
        match RESUMED.with(|slot| slot.borrow_mut().take()) {
            Some(Resume::Ready(resolved)) => Poll::Ready(Ok(resolved)),
            Some(Resume::Raise(error)) => Poll::Ready(Err(error)),
            Some(Resume::Start) | None => Poll::Ready(Err(Error::Usage(
                "suspension resumed without a result",
            ))),
        }
    }
}

/// Future awaiting one typed unit.
pub struct Awaiting<T> {
    inner: Suspend,
    _output: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> Awaiting<T> {
    pub(crate) fn new(unit: Unit) -> Self {
        Self {
            inner: suspend(Bundle::Single(unit)),
            _output: PhantomData,
        }
    }
}

impl<T: Clone + 'static> Future for Awaiting<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A deferred that already holds its outcome is read in place.
        let settled = match &self.inner.bundle {
            Some(Bundle::Single(Unit::Deferred(cell))) => cell.outcome(),
            _ => None,
        };
        if let Some(outcome) = settled {
            self.inner.bundle = None;
            return Poll::Ready(outcome.and_then(downcast::<T>));
        }
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(resolved) => {
                Poll::Ready(resolved.and_then(Resolved::into_single).and_then(downcast::<T>))
            }
        }
    }
}

struct AsyncComputation {
    future: Pin<Box<dyn Future<Output = Result<Value>>>>,
}

impl AsyncComputation {
    fn new<T, F>(future: F) -> Self
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        Self {
            future: Box::pin(async move { future.await.map(|value| Rc::new(value) as Value) }),
        }
    }
}

impl Computation for AsyncComputation {
    fn resume(&mut self, input: Resume) -> Step {
        if !matches!(input, Resume::Start) {
            RESUMED.with(|slot| *slot.borrow_mut() = Some(input));
        }
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let polled = self.future.as_mut().poll(&mut cx);
        RESUMED.with(|slot| slot.borrow_mut().take());
        let yielded = YIELDED.with(|slot| slot.borrow_mut().take());

        match polled {
            Poll::Ready(Ok(value)) => Step::Done(value),
            Poll::Ready(Err(error)) => Step::Failed(error),
            Poll::Pending => match yielded {
                Some(bundle) => Step::Suspend(bundle),
                None => Step::Failed(Error::ForeignAwait),
            },
        }
    }
}
