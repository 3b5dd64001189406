//! Telemetry for the batching executor.
//!
//! Structured logging setup, `metrics` facade recorders and per-executor
//! run statistics.

mod logging;
pub mod metrics;
mod store;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::describe_metrics;
pub use store::{BatchSizeSummary, StatsSnapshot};

pub(crate) use store::{RunStats, StatEvent};
