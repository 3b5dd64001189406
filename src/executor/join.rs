//! Typed helpers for awaiting several units at once.

use std::collections::BTreeMap;
use std::future::Future;

use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::executor::bundle::{Bundle, Unit};
use crate::executor::task::{downcast, suspend, Task, Value};

/// Something a task can wait on that yields a typed value.
pub trait Awaitable {
    type Output: Clone + 'static;

    fn into_unit(self) -> Unit;
}

impl<T: Clone + 'static> Awaitable for Task<T> {
    type Output = T;

    fn into_unit(self) -> Unit {
        self.into()
    }
}

impl<T: Clone + 'static> Awaitable for Deferred<T> {
    type Output = T;

    fn into_unit(self) -> Unit {
        self.into()
    }
}

impl<T: Clone + 'static> Awaitable for &Deferred<T> {
    type Output = T;

    fn into_unit(self) -> Unit {
        self.into()
    }
}

/// Tuples of awaitables, resolved together as one ordered bundle.
pub trait Join {
    type Output;

    fn into_units(self) -> Vec<Unit>;

    fn collect(values: Vec<Value>) -> Result<Self::Output>;
}

macro_rules! impl_join {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: Awaitable),+> Join for ($($name,)+) {
            type Output = ($($name::Output,)+);

            fn into_units(self) -> Vec<Unit> {
                vec![$(self.$index.into_unit()),+]
            }

            fn collect(values: Vec<Value>) -> Result<Self::Output> {
                let mut values = values.into_iter();
                Ok(($(
                    downcast::<$name::Output>(
                        values.next().ok_or(Error::Usage("join resolved too few values"))?,
                    )?,
                )+))
            }
        }
    };
}

impl_join!(A: 0);
impl_join!(A: 0, B: 1);
impl_join!(A: 0, B: 1, C: 2);
impl_join!(A: 0, B: 1, C: 2, D: 3);
impl_join!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_join!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_join!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_join!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// Awaits a tuple of tasks and deferreds, e.g. `join((a, b)).await?`.
pub fn join<J: Join>(units: J) -> impl Future<Output = Result<J::Output>> {
    let bundle = Bundle::Ordered(units.into_units());
    async move {
        let values = suspend(bundle).await?.into_ordered()?;
        J::collect(values)
    }
}

/// Awaits every unit and returns their values in input order.
pub fn join_all<A: Awaitable>(
    units: impl IntoIterator<Item = A>,
) -> impl Future<Output = Result<Vec<A::Output>>> {
    let bundle = Bundle::Ordered(units.into_iter().map(Awaitable::into_unit).collect());
    async move {
        suspend(bundle)
            .await?
            .into_ordered()?
            .into_iter()
            .map(downcast::<A::Output>)
            .collect()
    }
}

/// Awaits every unit and returns their values by key.
pub fn join_keyed<K, A>(
    units: impl IntoIterator<Item = (K, A)>,
) -> impl Future<Output = Result<BTreeMap<String, A::Output>>>
where
    K: Into<String>,
    A: Awaitable,
{
    let bundle = Bundle::Keyed(
        units
            .into_iter()
            .map(|(key, unit)| (key.into(), unit.into_unit()))
            .collect(),
    );
    async move {
        suspend(bundle)
            .await?
            .into_keyed()?
            .into_iter()
            .map(|(key, value)| Ok((key, downcast::<A::Output>(value)?)))
            .collect()
    }
}
