//! Executor lifecycle signals.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::Shared;

type Listener = Rc<RefCell<dyn FnMut()>>;

/// Points in the run loop that listeners can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Start of every run-loop iteration.
    Iteration,
    /// Tasks are pending but none is runnable.
    QueueExhausted,
}

#[derive(Default)]
pub(crate) struct Signal {
    listeners: RefCell<Vec<(u64, Listener)>>,
    next_id: Cell<u64>,
}

impl Signal {
    pub(crate) fn connect(&self, listener: impl FnMut() + 'static) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.listeners
            .borrow_mut()
            .push((id, Rc::new(RefCell::new(listener))));
        id
    }

    pub(crate) fn disconnect(&self, id: u64) {
        self.listeners.borrow_mut().retain(|(other, _)| *other != id);
    }

    /// Calls every listener connected at the time of the emit. Listeners
    /// removed by an earlier listener in the same emit are skipped.
    pub(crate) fn emit(&self) {
        let snapshot: Vec<(u64, Listener)> = self
            .listeners
            .borrow()
            .iter()
            .map(|(id, listener)| (*id, Rc::clone(listener)))
            .collect();
        for (id, listener) in snapshot {
            let connected = self.listeners.borrow().iter().any(|(other, _)| *other == id);
            if !connected {
                continue;
            }
            // A listener re-entering its own emit is skipped.
            if let Ok(mut listener) = listener.try_borrow_mut() {
                (*listener)();
            }
        }
    }
}

/// Keeps a listener connected until dropped.
#[must_use = "the listener disconnects when the subscription is dropped"]
pub struct Subscription {
    executor: Weak<Shared>,
    event: Event,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(executor: Weak<Shared>, event: Event, id: u64) -> Self {
        Self { executor, event, id }
    }

    pub fn event(&self) -> Event {
        self.event
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.executor.upgrade() {
            shared.signal(self.event).disconnect(self.id);
        }
    }
}
