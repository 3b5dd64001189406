//! Tree-scoped context.
//!
//! A [`Context`] is a property bag shared by a task and the context-bound
//! tasks it starts. Only one context is ambient at a time; a bound task
//! installs its own before every step and puts the previous one back after,
//! so tasks interleaved on the same executor never observe each other's
//! context.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::executor::task::{BoxComputation, Computation, Resume, Step, Task};
use crate::executor::{self, Executor};
use crate::local::LocalKey;

/// Mutable property bag. Clones share the same properties.
#[derive(Clone, Default)]
pub struct Context {
    props: Rc<RefCell<HashMap<String, Rc<dyn Any>>>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let props = self.props.borrow();
        let mut keys: Vec<&String> = props.keys().collect();
        keys.sort();
        f.debug_struct("Context").field("keys", &keys).finish()
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: 'static>(&self, key: impl Into<String>, value: T) {
        self.props.borrow_mut().insert(key.into(), Rc::new(value));
    }

    /// Returns the value under `key` if present and of type `T`.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let props = self.props.borrow();
        props.get(key)?.downcast_ref::<T>().cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.props.borrow().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.props.borrow_mut().remove(key).is_some()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.props, &other.props)
    }
}

#[derive(Default)]
struct Ambient {
    current: RefCell<Option<Context>>,
}

static AMBIENT: LocalKey<Ambient> = LocalKey::run_scoped(|_| Ambient::default());

impl Ambient {
    fn swap(&self, context: Option<Context>) -> Option<Context> {
        std::mem::replace(&mut *self.current.borrow_mut(), context)
    }
}

enum Boundary {
    New,
    Inherit,
}

struct Bound {
    inner: BoxComputation,
    boundary: Boundary,
    context: Option<Context>,
    started: bool,
}

impl Computation for Bound {
    fn resume(&mut self, input: Resume) -> Step {
        let Some(ambient) = executor::try_current().and_then(|ex| ex.local(&AMBIENT).ok()) else {
            return self.inner.resume(input);
        };
        if !self.started {
            self.started = true;
            if let Boundary::New = self.boundary {
                self.context = Some(Context::new());
            }
        }

        let caller = ambient.swap(self.context.take());
        let step = self.inner.resume(input);
        self.context = ambient.swap(caller);
        step
    }
}

fn bind<T: 'static>(task: Task<T>, boundary: Boundary, context: Option<Context>) -> Task<T> {
    Task::from_boxed(Box::new(Bound {
        inner: task.into_computation(),
        boundary,
        context,
        started: false,
    }))
}

/// Runs `task` in a fresh context that starts empty.
pub fn begin<T: 'static>(task: Task<T>) -> Task<T> {
    bind(task, Boundary::New, None)
}

/// Runs `task` in the context that is ambient where it is created, usually
/// the calling task's.
pub fn inherit<T: 'static>(task: Task<T>) -> Task<T> {
    let context = executor::try_current().and_then(|ex| ambient_on(&ex));
    bind(task, Boundary::Inherit, context)
}

/// Runs `task` in a given context.
pub fn within<T: 'static>(context: Context, task: Task<T>) -> Task<T> {
    bind(task, Boundary::Inherit, Some(context))
}

fn ambient_on(executor: &Executor) -> Option<Context> {
    let ambient = executor.local(&AMBIENT).ok()?;
    let current = ambient.current.borrow().clone();
    current
}

/// The ambient context. Fails outside a context-bound task.
pub fn current() -> Result<Context> {
    ambient_on(&executor::current()?).ok_or(Error::Usage("no context-bound task is running"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;

    #[test]
    fn test_context_properties() {
        let context = Context::new();
        context.set("user", "ada".to_string());
        context.set("retries", 3u8);
        assert_eq!(context.get::<String>("user").as_deref(), Some("ada"));
        assert_eq!(context.get::<u8>("retries"), Some(3));
        assert_eq!(context.get::<u32>("retries"), None);
        assert!(context.remove("user"));
        assert!(!context.contains("user"));
    }

    #[test]
    fn test_current_outside_bound_task_fails() {
        assert!(current().is_err());
        let inside = Executor::new().run(Task::new(async { Ok(current().is_err()) }));
        assert!(inside.unwrap());
    }

    #[test]
    fn test_within_uses_given_context() {
        let context = Context::new();
        context.set("tenant", 9u32);
        let seen = Executor::new()
            .run(within(
                context.clone(),
                Task::new(async { Ok(current()?.get::<u32>("tenant")) }),
            ))
            .unwrap();
        assert_eq!(seen, Some(9));
    }

    #[test]
    fn test_context_restored_between_interleaved_steps() {
        // Two bound tasks suspend on the same gate and are resumed in one pass.
        let result = Executor::new().run(Task::new(async {
            let gate = Deferred::<()>::new();
            let task = |tag: u32, gate: Deferred<()>| {
                begin(Task::new(async move {
                    current()?.set("tag", tag);
                    gate.await?;
                    Ok(current()?.get::<u32>("tag"))
                }))
            };
            let a = crate::spawn(task(1, gate.clone()))?;
            let b = crate::spawn(task(2, gate.clone()))?;
            let outside = Task::new({
                let gate = gate.clone();
                async move {
                    let ambient = current().is_err();
                    gate.set_value(())?;
                    Ok(ambient)
                }
            });
            let (clean, a, b) = crate::join((outside, a, b)).await?;
            Ok((clean, a, b))
        }));
        assert_eq!(result.unwrap(), (true, Some(1), Some(2)));
    }
}
