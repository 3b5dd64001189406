//! Metric names and facade recorders.
//!
//! Nothing is exported unless the host installs a `metrics` recorder.

use super::store::StatEvent;

pub const ITERATIONS_TOTAL: &str = "batchloop_iterations_total";
pub const QUEUE_EXHAUSTED_TOTAL: &str = "batchloop_queue_exhausted_total";
pub const TASKS_SCHEDULED_TOTAL: &str = "batchloop_tasks_scheduled_total";
pub const TASKS_FINISHED_TOTAL: &str = "batchloop_tasks_finished_total";
pub const HOOKS_FIRED_TOTAL: &str = "batchloop_hooks_fired_total";
pub const BATCHES_DISPATCHED_TOTAL: &str = "batchloop_batches_dispatched_total";
pub const BATCH_SIZE: &str = "batchloop_batch_size";
pub const BRIDGE_COMPLETIONS_TOTAL: &str = "batchloop_bridge_completions_total";

/// Registers descriptions for every metric this crate emits.
pub fn describe_metrics() {
    ::metrics::describe_counter!(ITERATIONS_TOTAL, "Run-loop iterations across all executors");
    ::metrics::describe_counter!(QUEUE_EXHAUSTED_TOTAL, "Times the run queue emptied with work pending");
    ::metrics::describe_counter!(TASKS_SCHEDULED_TOTAL, "Tasks registered with an executor");
    ::metrics::describe_counter!(TASKS_FINISHED_TOTAL, "Tasks that reached a terminal outcome");
    ::metrics::describe_counter!(HOOKS_FIRED_TOTAL, "Drain hooks fired");
    ::metrics::describe_counter!(BATCHES_DISPATCHED_TOTAL, "Batch groups handed to their batched function");
    ::metrics::describe_histogram!(BATCH_SIZE, "Calls coalesced per dispatched batch group");
    ::metrics::describe_counter!(BRIDGE_COMPLETIONS_TOTAL, "External completions delivered by the bridge");
}

pub(crate) fn record(event: StatEvent) {
    match event {
        StatEvent::Iteration => ::metrics::counter!(ITERATIONS_TOTAL).increment(1),
        StatEvent::QueueExhausted => ::metrics::counter!(QUEUE_EXHAUSTED_TOTAL).increment(1),
        StatEvent::TaskScheduled => ::metrics::counter!(TASKS_SCHEDULED_TOTAL).increment(1),
        StatEvent::TaskSucceeded => {
            ::metrics::counter!(TASKS_FINISHED_TOTAL, "outcome" => "success").increment(1)
        }
        StatEvent::TaskFailed => {
            ::metrics::counter!(TASKS_FINISHED_TOTAL, "outcome" => "failure").increment(1)
        }
        StatEvent::HookFired => ::metrics::counter!(HOOKS_FIRED_TOTAL).increment(1),
        StatEvent::BatchDispatched { size } => {
            ::metrics::counter!(BATCHES_DISPATCHED_TOTAL).increment(1);
            ::metrics::histogram!(BATCH_SIZE).record(size as f64);
        }
        StatEvent::BridgeCompleted { count } => {
            ::metrics::counter!(BRIDGE_COMPLETIONS_TOTAL).increment(count as u64)
        }
    }
}
