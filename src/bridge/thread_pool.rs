//! Bounded worker pool for blocking jobs whose results are bridged back
//! into an executor.
//!
//! One shared FIFO queue feeds every worker. Jobs run outside the queue
//! lock; a panicking job does not take its worker down.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPoolConfig {
    /// Number of worker threads (0 = one per CPU).
    pub num_threads: usize,
    /// Maximum jobs waiting for a worker.
    pub queue_size: usize,
    pub thread_name_prefix: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            queue_size: 256,
            thread_name_prefix: "batchloop-worker".to_string(),
        }
    }
}

impl ThreadPoolConfig {
    /// Worker count after resolving 0 to the CPU count.
    pub fn effective_threads(&self) -> usize {
        if self.num_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.num_threads
        }
    }
}

/// A job run on a worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Counters for pool activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThreadPoolStats {
    pub jobs_executed: u64,
    pub jobs_panicked: u64,
    pub queue_overflows: u64,
    pub threads_active: usize,
    pub queued: usize,
}

struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<Queue>,
    available: Condvar,
    executed: AtomicU64,
    panicked: AtomicU64,
    overflows: AtomicU64,
    active: AtomicUsize,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    config: ThreadPoolConfig,
}

impl ThreadPool {
    pub fn new(config: ThreadPoolConfig) -> Result<Self, ThreadPoolError> {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::with_capacity(config.queue_size),
                shutdown: false,
            }),
            available: Condvar::new(),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        });

        let mut pool = Self {
            shared,
            workers: Vec::new(),
            config,
        };
        for id in 0..pool.config.effective_threads() {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", pool.config.thread_name_prefix, id))
                .spawn(move || Self::worker_loop(&shared))
                .map_err(|e| ThreadPoolError::ThreadSpawnFailed(e.to_string()))?;
            pool.workers.push(handle);
        }
        Ok(pool)
    }

    /// Queues `job` for execution on a worker.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), ThreadPoolError> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(ThreadPoolError::PoolShutdown);
            }
            if queue.jobs.len() >= self.config.queue_size {
                self.shared.overflows.fetch_add(1, Ordering::Relaxed);
                return Err(ThreadPoolError::QueueFull);
            }
            queue.jobs.push_back(Box::new(job));
        }
        self.shared.available.notify_one();
        Ok(())
    }

    fn worker_loop(shared: &PoolShared) {
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        break job;
                    }
                    if queue.shutdown {
                        return;
                    }
                    shared.available.wait(&mut queue);
                }
            };

            shared.active.fetch_add(1, Ordering::Relaxed);
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                shared.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    thread = thread::current().name().unwrap_or("worker"),
                    "pool job panicked"
                );
            }
            shared.active.fetch_sub(1, Ordering::Relaxed);
            shared.executed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> ThreadPoolStats {
        ThreadPoolStats {
            jobs_executed: self.shared.executed.load(Ordering::Relaxed),
            jobs_panicked: self.shared.panicked.load(Ordering::Relaxed),
            queue_overflows: self.shared.overflows.load(Ordering::Relaxed),
            threads_active: self.shared.active.load(Ordering::Relaxed),
            queued: self.shared.queue.lock().jobs.len(),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.queue.lock().shutdown
    }

    /// Stops accepting jobs, lets workers finish what is queued, and joins
    /// them.
    pub fn shutdown(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Errors for thread pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThreadPoolError {
    #[error("Thread pool is shut down")]
    PoolShutdown,

    #[error("Job queue is full")]
    QueueFull,

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawnFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn small_pool(threads: usize, queue_size: usize) -> ThreadPool {
        ThreadPool::new(ThreadPoolConfig {
            num_threads: threads,
            queue_size,
            thread_name_prefix: "test-worker".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_jobs_run_on_named_workers() {
        let pool = small_pool(2, 16);
        assert_eq!(pool.num_threads(), 2);

        let (tx, rx) = mpsc::channel();
        pool.execute(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        })
        .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("test-worker-"));
    }

    #[test]
    fn test_queue_full() {
        let mut pool = small_pool(1, 1);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.execute(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.execute(|| {}).unwrap();
        assert_eq!(pool.execute(|| {}), Err(ThreadPoolError::QueueFull));
        assert_eq!(pool.stats().queue_overflows, 1);

        release_tx.send(()).unwrap();
        pool.shutdown();
        assert_eq!(pool.stats().jobs_executed, 2);
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let mut pool = small_pool(1, 4);
        pool.execute(|| panic!("job failed")).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(7).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.shutdown();
        assert_eq!(pool.stats().jobs_panicked, 1);
    }

    #[test]
    fn test_execute_after_shutdown() {
        let mut pool = small_pool(1, 4);
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert_eq!(pool.execute(|| {}), Err(ThreadPoolError::PoolShutdown));
    }

    #[test]
    fn test_auto_thread_count() {
        let config = ThreadPoolConfig::default();
        assert!(config.effective_threads() >= 1);
    }
}
