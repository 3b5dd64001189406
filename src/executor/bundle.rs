//! Dependency bundles and result assembly.

use std::collections::BTreeMap;

use crate::deferred::{Deferred, DeferredCell};
use crate::error::{Error, Result};
use crate::executor::task::{BoxComputation, Task, Value};

/// One schedulable dependency.
pub enum Unit {
    Task(BoxComputation),
    Deferred(DeferredCell),
}

impl<T: 'static> From<Task<T>> for Unit {
    fn from(task: Task<T>) -> Self {
        Unit::Task(task.into_computation())
    }
}

impl<T> From<Deferred<T>> for Unit {
    fn from(deferred: Deferred<T>) -> Self {
        Unit::Deferred(deferred.cell().clone())
    }
}

impl<T> From<&Deferred<T>> for Unit {
    fn from(deferred: &Deferred<T>) -> Self {
        Unit::Deferred(deferred.cell().clone())
    }
}

/// The set of units a task waits on, chosen once per suspension.
pub enum Bundle {
    Single(Unit),
    Ordered(Vec<Unit>),
    Keyed(BTreeMap<String, Unit>),
}

impl Bundle {
    pub fn single(unit: impl Into<Unit>) -> Self {
        Bundle::Single(unit.into())
    }

    pub fn ordered<U: Into<Unit>>(units: impl IntoIterator<Item = U>) -> Self {
        Bundle::Ordered(units.into_iter().map(Into::into).collect())
    }

    pub fn keyed<K, U>(units: impl IntoIterator<Item = (K, U)>) -> Self
    where
        K: Into<String>,
        U: Into<Unit>,
    {
        Bundle::Keyed(
            units
                .into_iter()
                .map(|(key, unit)| (key.into(), unit.into()))
                .collect(),
        )
    }

    /// Splits the bundle into an empty result container and the units to
    /// schedule, each tagged with the slot its result lands in.
    pub(crate) fn split(self) -> (Partial, Vec<(Slot, Unit)>) {
        match self {
            Bundle::Single(unit) => (Partial::Single(None), vec![(Slot::Single, unit)]),
            Bundle::Ordered(units) => {
                let partial = Partial::Ordered(units.iter().map(|_| None).collect());
                let units = units
                    .into_iter()
                    .enumerate()
                    .map(|(index, unit)| (Slot::Index(index), unit))
                    .collect();
                (partial, units)
            }
            Bundle::Keyed(units) => {
                let partial = Partial::Keyed(units.keys().map(|key| (key.clone(), None)).collect());
                let units = units
                    .into_iter()
                    .map(|(key, unit)| (Slot::Key(key), unit))
                    .collect();
                (partial, units)
            }
        }
    }
}

/// Results of a bundle, in the shape the bundle was declared.
pub enum Resolved {
    Single(Value),
    Ordered(Vec<Value>),
    Keyed(BTreeMap<String, Value>),
}

impl Resolved {
    pub fn into_single(self) -> Result<Value> {
        match self {
            Resolved::Single(value) => Ok(value),
            _ => Err(Error::Usage("expected a single result")),
        }
    }

    pub fn into_ordered(self) -> Result<Vec<Value>> {
        match self {
            Resolved::Ordered(values) => Ok(values),
            _ => Err(Error::Usage("expected ordered results")),
        }
    }

    pub fn into_keyed(self) -> Result<BTreeMap<String, Value>> {
        match self {
            Resolved::Keyed(values) => Ok(values),
            _ => Err(Error::Usage("expected keyed results")),
        }
    }
}

/// Where a completed unit's value belongs.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Single,
    Index(usize),
    Key(String),
}

/// Results collected so far for the bundle a task is waiting on.
pub(crate) enum Partial {
    Single(Option<Value>),
    Ordered(Vec<Option<Value>>),
    Keyed(BTreeMap<String, Option<Value>>),
}

impl Partial {
    /// Stores a value. Returns false if the slot was unknown or already set.
    pub(crate) fn fill(&mut self, slot: &Slot, value: Value) -> bool {
        let target = match (self, slot) {
            (Partial::Single(target), Slot::Single) => target,
            (Partial::Ordered(values), Slot::Index(index)) => match values.get_mut(*index) {
                Some(target) => target,
                None => return false,
            },
            (Partial::Keyed(values), Slot::Key(key)) => match values.get_mut(key) {
                Some(target) => target,
                None => return false,
            },
            _ => return false,
        };
        if target.is_some() {
            return false;
        }
        *target = Some(value);
        true
    }

    pub(crate) fn assemble(self) -> Result<Resolved> {
        const INCOMPLETE: Error = Error::Usage("bundle resumed before every unit resolved");
        match self {
            Partial::Single(value) => value.map(Resolved::Single).ok_or(INCOMPLETE),
            Partial::Ordered(values) => values
                .into_iter()
                .collect::<Option<Vec<_>>>()
                .map(Resolved::Ordered)
                .ok_or(INCOMPLETE),
            Partial::Keyed(values) => values
                .into_iter()
                .map(|(key, value)| value.map(|value| (key, value)))
                .collect::<Option<BTreeMap<_, _>>>()
                .map(Resolved::Keyed)
                .ok_or(INCOMPLETE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::task::downcast;
    use std::rc::Rc;

    #[test]
    fn test_ordered_assembly_keeps_declared_order() {
        let bundle = Bundle::ordered(vec![Task::ready(1u8), Task::ready(2u8), Task::ready(3u8)]);
        let (mut partial, units) = bundle.split();
        assert_eq!(units.len(), 3);

        // Fill out of order.
        for (slot, value) in [(Slot::Index(2), 30u8), (Slot::Index(0), 10), (Slot::Index(1), 20)] {
            assert!(partial.fill(&slot, Rc::new(value)));
        }
        let values = partial.assemble().unwrap().into_ordered().unwrap();
        let values: Vec<u8> = values.into_iter().map(|v| downcast(v).unwrap()).collect();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn test_keyed_assembly() {
        let bundle = Bundle::keyed([("a", Task::ready(1u8)), ("b", Task::ready(2u8))]);
        let (mut partial, _units) = bundle.split();
        assert!(partial.fill(&Slot::Key("b".into()), Rc::new(2u8)));
        assert!(partial.fill(&Slot::Key("a".into()), Rc::new(1u8)));
        assert!(!partial.fill(&Slot::Key("c".into()), Rc::new(3u8)));

        let values = partial.assemble().unwrap().into_keyed().unwrap();
        assert_eq!(values.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_incomplete_assembly_is_rejected() {
        let (partial, _units) = Bundle::ordered(vec![Task::ready(1u8), Task::ready(2u8)]).split();
        assert!(partial.assemble().is_err());
    }

    #[test]
    fn test_slot_filled_once() {
        let (mut partial, _units) = Bundle::single(Task::ready(1u8)).split();
        assert!(partial.fill(&Slot::Single, Rc::new(1u8)));
        assert!(!partial.fill(&Slot::Single, Rc::new(2u8)));
    }
}
