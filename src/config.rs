//! Runtime configuration loaded from environment variables.
//!
//! Every value has a default; missing or unparsable variables fall back to it.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `BATCHLOOP_BRIDGE_PRIORITY` | 5 | Hook priority of the external-work bridge |
//! | `BATCHLOOP_POOL_THREADS` | 0 | Bridge worker pool size (0 = CPU count) |
//! | `BATCHLOOP_POOL_QUEUE_SIZE` | 256 | Max jobs waiting in the worker pool |
//! | `BATCHLOOP_POOL_THREAD_PREFIX` | `batchloop-worker` | Worker thread name prefix |
//! | `BATCHLOOP_LOG_LEVEL` | `info` | `tracing` filter directive |
//! | `BATCHLOOP_LOG_FORMAT` | `json` | `json`, `pretty` or `compact` |
//! | `BATCHLOOP_LOG_FILE` | unset | Log file path (stderr when unset) |

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bridge::{ThreadPool, ThreadPoolConfig, ThreadPoolError};
use crate::telemetry::{self, LogConfig, LogError, LogFormat};

/// Priority of the bridge check-back hook. Above the default batch priority,
/// so finished external work is collected before batches flush.
pub const DEFAULT_BRIDGE_PRIORITY: i32 = 5;

/// Configuration carried by every executor.
///
/// Executors only read `bridge_hook_priority`. The pool and log settings are
/// applied by the host through [`RuntimeConfig::build_pool`] and
/// [`RuntimeConfig::init_logging`].
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub bridge_hook_priority: i32,
    pub thread_pool: ThreadPoolConfig,
    pub log: LogConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bridge_hook_priority: DEFAULT_BRIDGE_PRIORITY,
            thread_pool: ThreadPoolConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Serializable summary of the values actually in effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub bridge_hook_priority: i32,
    pub pool_threads: usize,
    pub pool_queue_size: usize,
    pub pool_thread_prefix: String,
    pub log_level: String,
    pub log_format: String,
    pub log_file: Option<PathBuf>,
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

fn string_env(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val,
        _ => default.to_string(),
    }
}

fn load_thread_pool_config() -> ThreadPoolConfig {
    let defaults = ThreadPoolConfig::default();
    let num_threads = parse_env("BATCHLOOP_POOL_THREADS", defaults.num_threads);
    let queue_size = parse_env("BATCHLOOP_POOL_QUEUE_SIZE", defaults.queue_size).max(1);
    let thread_name_prefix =
        string_env("BATCHLOOP_POOL_THREAD_PREFIX", &defaults.thread_name_prefix);
    ThreadPoolConfig {
        num_threads,
        queue_size,
        thread_name_prefix,
    }
}

fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    LogConfig {
        format: parse_env("BATCHLOOP_LOG_FORMAT", defaults.format),
        level: string_env("BATCHLOOP_LOG_LEVEL", &defaults.level),
        output_path: std::env::var_os("BATCHLOOP_LOG_FILE").map(PathBuf::from),
    }
}

/// Loads configuration from `BATCHLOOP_*` environment variables.
pub fn load() -> RuntimeConfig {
    RuntimeConfig {
        bridge_hook_priority: parse_env("BATCHLOOP_BRIDGE_PRIORITY", DEFAULT_BRIDGE_PRIORITY),
        thread_pool: load_thread_pool_config(),
        log: load_log_config(),
    }
}

impl RuntimeConfig {
    /// Starts a worker pool for `bridge::submit` and `bridge::offload`.
    pub fn build_pool(&self) -> Result<ThreadPool, ThreadPoolError> {
        ThreadPool::new(self.thread_pool.clone())
    }

    /// Installs the global subscriber described by `log`.
    pub fn init_logging(&self) -> Result<(), LogError> {
        telemetry::init_logging(&self.log)
    }

    pub fn effective(&self) -> EffectiveConfig {
        let log_format = match self.log.format {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
            LogFormat::Compact => "compact",
        };
        EffectiveConfig {
            bridge_hook_priority: self.bridge_hook_priority,
            pool_threads: self.thread_pool.effective_threads(),
            pool_queue_size: self.thread_pool.queue_size,
            pool_thread_prefix: self.thread_pool.thread_name_prefix.clone(),
            log_level: self.log.level.clone(),
            log_format: log_format.to_string(),
            log_file: self.log.output_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "BATCHLOOP_BRIDGE_PRIORITY",
        "BATCHLOOP_POOL_THREADS",
        "BATCHLOOP_POOL_QUEUE_SIZE",
        "BATCHLOOP_POOL_THREAD_PREFIX",
        "BATCHLOOP_LOG_LEVEL",
        "BATCHLOOP_LOG_FORMAT",
        "BATCHLOOP_LOG_FILE",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.bridge_hook_priority, 5);
        assert_eq!(cfg.thread_pool.num_threads, 0);
        assert_eq!(cfg.thread_pool.queue_size, 256);
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert!(cfg.log.output_path.is_none());
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BATCHLOOP_BRIDGE_PRIORITY", "-2");
        std::env::set_var("BATCHLOOP_POOL_THREADS", "3");
        std::env::set_var("BATCHLOOP_POOL_THREAD_PREFIX", "io");
        std::env::set_var("BATCHLOOP_LOG_FORMAT", "compact");
        std::env::set_var("BATCHLOOP_LOG_LEVEL", "batchloop=trace");
        let cfg = load();
        assert_eq!(cfg.bridge_hook_priority, -2);
        assert_eq!(cfg.thread_pool.num_threads, 3);
        assert_eq!(cfg.thread_pool.thread_name_prefix, "io");
        assert_eq!(cfg.log.format, LogFormat::Compact);
        assert_eq!(cfg.log.level, "batchloop=trace");
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BATCHLOOP_BRIDGE_PRIORITY", "high");
        std::env::set_var("BATCHLOOP_POOL_THREADS", "many");
        std::env::set_var("BATCHLOOP_LOG_FORMAT", "xml");
        std::env::set_var("BATCHLOOP_LOG_LEVEL", "   ");
        let cfg = load();
        assert_eq!(cfg.bridge_hook_priority, DEFAULT_BRIDGE_PRIORITY);
        assert_eq!(cfg.thread_pool.num_threads, 0);
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.log.level, "info");
        clear_env_vars();
    }

    #[test]
    fn test_queue_size_floor() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BATCHLOOP_POOL_QUEUE_SIZE", "0");
        let cfg = load();
        assert_eq!(cfg.thread_pool.queue_size, 1);
        clear_env_vars();
    }

    #[test]
    fn test_build_pool_uses_pool_settings() {
        let config = RuntimeConfig {
            thread_pool: ThreadPoolConfig {
                num_threads: 2,
                queue_size: 8,
                thread_name_prefix: "cfg-pool".to_string(),
            },
            ..RuntimeConfig::default()
        };
        let mut pool = config.build_pool().unwrap();
        assert_eq!(pool.num_threads(), 2);
        pool.shutdown();
        assert!(pool.is_shutdown());
    }

    #[test]
    fn test_effective_config_resolves_thread_count() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("BATCHLOOP_LOG_FILE", "/tmp/batchloop.log");
        let eff = load().effective();
        assert!(eff.pool_threads >= 1);
        assert_eq!(eff.log_format, "json");
        assert_eq!(eff.log_file, Some(PathBuf::from("/tmp/batchloop.log")));

        let json = serde_json::to_string(&eff).unwrap();
        assert!(json.contains("\"bridge_hook_priority\":5"));
        clear_env_vars();
    }
}
