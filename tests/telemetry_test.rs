//! Telemetry and configuration tests.

use batchloop::batch::Batcher;
use batchloop::config::{self, RuntimeConfig, DEFAULT_BRIDGE_PRIORITY};
use batchloop::telemetry::{describe_metrics, init_logging, LogConfig, LogError, LogFormat, StatsSnapshot};
use batchloop::{join, Executor, Task};

// =============================================================================
// Run statistics
// =============================================================================

fn run_two_batches(executor: &Executor) {
    let echo = Batcher::<u8, u8>::named("echo", |values| Task::ready(values));
    executor
        .run(Task::new(async move {
            join((echo.call(1), echo.call(2), echo.call(3))).await?;
            echo.call(4).await?;
            Ok(())
        }))
        .unwrap();
}

#[test]
fn stats_track_batches_and_hooks() {
    let executor = Executor::new();
    run_two_batches(&executor);

    let stats = executor.stats();
    assert_eq!(stats.batches.count, 2);
    assert_eq!(stats.batches.sum, 4);
    assert_eq!(stats.batches.min, 1);
    assert_eq!(stats.batches.max, 3);
    assert_eq!(stats.hooks_fired, 2);
    assert_eq!(stats.queue_exhaustions, 2);
    assert_eq!(stats.tasks_failed, 0);
    assert_eq!(stats.tasks_scheduled, stats.tasks_succeeded);
}

#[test]
fn stats_accumulate_across_runs() {
    let executor = Executor::new();
    run_two_batches(&executor);
    let first = executor.stats();
    run_two_batches(&executor);
    let second = executor.stats();
    assert_eq!(second.batches.count, 2 * first.batches.count);
    assert_eq!(second.iterations, 2 * first.iterations);
}

#[test]
fn stats_snapshot_serializes() {
    let executor = Executor::new();
    run_two_batches(&executor);
    let json = executor.stats().to_json().unwrap();
    let parsed: StatsSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, executor.stats());
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["batches"]["max"], 3);
}

#[test]
fn metrics_without_recorder_are_noops() {
    describe_metrics();
    run_two_batches(&Executor::new());
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn defaults() {
    let config = RuntimeConfig::default();
    assert_eq!(config.bridge_hook_priority, DEFAULT_BRIDGE_PRIORITY);
    assert_eq!(config.thread_pool.queue_size, 256);
    assert_eq!(config.log.format, LogFormat::Json);

    let effective = config.effective();
    assert_eq!(effective.log_format, "json");
    assert!(effective.pool_threads >= 1);
}

// The only test in this binary that touches the environment.
#[test]
fn environment_overrides() {
    std::env::set_var("BATCHLOOP_BRIDGE_PRIORITY", "-3");
    std::env::set_var("BATCHLOOP_POOL_THREADS", "2");
    std::env::set_var("BATCHLOOP_POOL_QUEUE_SIZE", "0");
    std::env::set_var("BATCHLOOP_LOG_FORMAT", "compact");
    std::env::set_var("BATCHLOOP_LOG_LEVEL", "batchloop=debug");

    let loaded = config::load();
    let executor = Executor::from_env();

    for key in [
        "BATCHLOOP_BRIDGE_PRIORITY",
        "BATCHLOOP_POOL_THREADS",
        "BATCHLOOP_POOL_QUEUE_SIZE",
        "BATCHLOOP_LOG_FORMAT",
        "BATCHLOOP_LOG_LEVEL",
    ] {
        std::env::remove_var(key);
    }

    assert_eq!(loaded.bridge_hook_priority, -3);
    assert_eq!(loaded.thread_pool.num_threads, 2);
    assert_eq!(loaded.thread_pool.queue_size, 1);
    assert_eq!(loaded.log.format, LogFormat::Compact);
    assert_eq!(loaded.log.level, "batchloop=debug");
    assert_eq!(executor.config(), &loaded);
}

// =============================================================================
// Logging
// =============================================================================

#[test]
fn log_format_parsing() {
    assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    assert!(matches!("yaml".parse::<LogFormat>(), Err(LogError::UnknownFormat(_))));
}

// The only test in this binary that installs a subscriber.
#[test]
fn init_logging_writes_json_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batchloop.log");
    let config = LogConfig {
        format: LogFormat::Json,
        level: "batchloop=debug".to_string(),
        output_path: Some(path.clone()),
    };
    let runtime = RuntimeConfig {
        log: config.clone(),
        ..RuntimeConfig::default()
    };
    runtime.init_logging().unwrap();

    let second = LogConfig {
        output_path: Some(dir.path().join("second.log")),
        ..config.clone()
    };
    assert!(matches!(init_logging(&second), Err(LogError::AlreadyInitialized)));

    run_two_batches(&Executor::new());

    let contents = std::fs::read_to_string(&path).unwrap();
    let first = contents.lines().next().expect("log file is empty");
    let event: serde_json::Value = serde_json::from_str(first).unwrap();
    assert!(event.get("level").is_some());
    assert!(contents.contains("dispatching batch"));
}
