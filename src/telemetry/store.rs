//! Per-executor run statistics.
//!
//! Counts what one executor did across its runs. Every recorded event is
//! also forwarded to the `metrics` facade, so process-wide exporters see
//! the same numbers aggregated over all executors.

use std::cell::Cell;

use serde::{Deserialize, Serialize};

use super::metrics;

/// Something worth counting in the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatEvent {
    Iteration,
    QueueExhausted,
    TaskScheduled,
    TaskSucceeded,
    TaskFailed,
    HookFired,
    BatchDispatched { size: usize },
    BridgeCompleted { count: usize },
}

/// Summary of the batch sizes seen so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSizeSummary {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

/// Point-in-time copy of an executor's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub iterations: u64,
    pub queue_exhaustions: u64,
    pub tasks_scheduled: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub hooks_fired: u64,
    pub bridge_completions: u64,
    pub batches: BatchSizeSummary,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Default)]
pub(crate) struct RunStats {
    iterations: Cell<u64>,
    queue_exhaustions: Cell<u64>,
    tasks_scheduled: Cell<u64>,
    tasks_succeeded: Cell<u64>,
    tasks_failed: Cell<u64>,
    hooks_fired: Cell<u64>,
    bridge_completions: Cell<u64>,
    batch_count: Cell<u64>,
    batch_sum: Cell<u64>,
    batch_min: Cell<u64>,
    batch_max: Cell<u64>,
}

fn bump(counter: &Cell<u64>, by: u64) {
    counter.set(counter.get().saturating_add(by));
}

impl RunStats {
    pub(crate) fn record(&self, event: StatEvent) {
        match event {
            StatEvent::Iteration => bump(&self.iterations, 1),
            StatEvent::QueueExhausted => bump(&self.queue_exhaustions, 1),
            StatEvent::TaskScheduled => bump(&self.tasks_scheduled, 1),
            StatEvent::TaskSucceeded => bump(&self.tasks_succeeded, 1),
            StatEvent::TaskFailed => bump(&self.tasks_failed, 1),
            StatEvent::HookFired => bump(&self.hooks_fired, 1),
            StatEvent::BatchDispatched { size } => {
                let size = size as u64;
                if self.batch_count.get() == 0 || size < self.batch_min.get() {
                    self.batch_min.set(size);
                }
                if size > self.batch_max.get() {
                    self.batch_max.set(size);
                }
                bump(&self.batch_count, 1);
                bump(&self.batch_sum, size);
            }
            StatEvent::BridgeCompleted { count } => bump(&self.bridge_completions, count as u64),
        }
        metrics::record(event);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            iterations: self.iterations.get(),
            queue_exhaustions: self.queue_exhaustions.get(),
            tasks_scheduled: self.tasks_scheduled.get(),
            tasks_succeeded: self.tasks_succeeded.get(),
            tasks_failed: self.tasks_failed.get(),
            hooks_fired: self.hooks_fired.get(),
            bridge_completions: self.bridge_completions.get(),
            batches: BatchSizeSummary {
                count: self.batch_count.get(),
                sum: self.batch_sum.get(),
                min: self.batch_min.get(),
                max: self.batch_max.get(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RunStats::default();
        stats.record(StatEvent::Iteration);
        stats.record(StatEvent::Iteration);
        stats.record(StatEvent::TaskScheduled);
        stats.record(StatEvent::TaskFailed);
        stats.record(StatEvent::BridgeCompleted { count: 3 });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.iterations, 2);
        assert_eq!(snapshot.tasks_scheduled, 1);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.tasks_succeeded, 0);
        assert_eq!(snapshot.bridge_completions, 3);
    }

    #[test]
    fn test_batch_size_summary() {
        let stats = RunStats::default();
        for size in [4, 1, 7] {
            stats.record(StatEvent::BatchDispatched { size });
        }
        let batches = stats.snapshot().batches;
        assert_eq!(batches.count, 3);
        assert_eq!(batches.sum, 12);
        assert_eq!(batches.min, 1);
        assert_eq!(batches.max, 7);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = RunStats::default();
        stats.record(StatEvent::HookFired);
        let json = stats.snapshot().to_json().unwrap();
        let parsed: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.hooks_fired, 1);
    }
}
