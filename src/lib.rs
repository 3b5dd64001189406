//! batchloop
//!
//! A single-threaded cooperative executor that coalesces calls. Tasks
//! suspend on bundles of other tasks and deferreds; whenever the run queue
//! drains with work still pending, exactly one drain-time hook fires. The
//! batch coalescer uses those hooks to hand every call collected under one
//! key to its batched function in a single invocation.
//!
//! # Layers
//!
//! - **Executor**: task arena, FIFO run queue, dependency counting
//! - **Deferred**: write-once result handles
//! - **Hooks**: one priority-ordered callback per queue exhaustion
//! - **Batching**: per-key call groups dispatched from hooks
//! - **Context**: tree-scoped properties swapped around every step
//! - **Bridge**: results from worker threads and tokio runtimes
//!
//! # Example
//!
//! ```
//! use batchloop::{batch::Batcher, Task};
//!
//! let square = Batcher::<u64, u64>::named("square", |values: Vec<u64>| {
//!     Task::new(async move { Ok(values.into_iter().map(|v| v * v).collect()) })
//! });
//! let squares = batchloop::run(Task::new(async move {
//!     batchloop::join_all((1..=3).map(|v| square.call(v))).await
//! }))
//! .unwrap();
//! assert_eq!(squares, vec![1, 4, 9]);
//! ```

pub mod batch;
pub mod bridge;
pub mod clients;
pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod executor;
pub mod hook;
pub mod local;
pub mod priority;
pub mod telemetry;
pub mod util;

pub use deferred::{future, wait, Deferred};
pub use error::{Error, Result};
pub use executor::bundle::{Bundle, Resolved, Unit};
pub use executor::events::{Event, Subscription};
pub use executor::join::{join, join_all, join_keyed};
pub use executor::task::{suspend, Computation, Resume, Step, Task, Value};
pub use executor::{spawn, Executor, TaskId};

/// Runs `task` to completion on a fresh executor configured from the
/// environment.
pub fn run<T: Clone + 'static>(task: Task<T>) -> Result<T> {
    Executor::from_env().run(task)
}
