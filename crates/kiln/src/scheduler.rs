//! Load-aware admission and worker pool sizing
//!
//! Every compilation or batch run holds a [`WorkerPermit`] from the current
//! pool. The pool is sized from the host [`LoadLevel`] and replaced, never
//! resized, when the recommended size changes: permits of the old pool stay
//! valid until their holders finish.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::resources::{LoadLevel, LoadSample, ResourceMonitor};

/// Recommended worker count for a load level
pub fn pool_size(level: LoadLevel, cpus: usize) -> usize {
    match level {
        LoadLevel::High => (cpus / 2).max(2),
        LoadLevel::Medium => cpus.saturating_sub(1).max(2),
        LoadLevel::Normal => cpus.max(1),
    }
}

/// Whether a reading crosses either high-water mark
pub fn should_throttle(sample: &LoadSample, config: &SchedulerConfig) -> bool {
    sample.cpu_percent >= config.throttle_cpu_percent
        || sample.memory_percent >= config.throttle_memory_percent
}

/// Outcome of one admission decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub throttled: bool,
    pub level: LoadLevel,
    pub sample: LoadSample,
}

#[derive(Debug)]
struct WorkerPool {
    size: usize,
    generation: u64,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    fn new(size: usize, generation: u64) -> Self {
        Self {
            size,
            generation,
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }
}

/// A slot in the worker pool, released on drop
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
    pub pool_size: usize,
    pub level: LoadLevel,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of scheduler state
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub cpus: usize,
    pub pool_size: usize,
    pub pool_generation: u64,
    pub active_workers: usize,
    pub load_level: LoadLevel,
    pub throttled_admissions: u64,
}

/// Adaptive scheduler over a replaceable worker pool
#[derive(Debug)]
pub struct Scheduler {
    monitor: Arc<ResourceMonitor>,
    config: SchedulerConfig,
    cpus: usize,
    pool: RwLock<Arc<WorkerPool>>,
    active: Arc<AtomicUsize>,
    throttled: AtomicU64,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig, monitor: Arc<ResourceMonitor>) -> Self {
        let cpus = config.cpu_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        });
        let level = monitor.load_level();

        Self {
            monitor,
            config: config.clone(),
            cpus,
            pool: RwLock::new(Arc::new(WorkerPool::new(pool_size(level, cpus), 0))),
            active: Arc::new(AtomicUsize::new(0)),
            throttled: AtomicU64::new(0),
        }
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Sample the host once and decide whether to delay this admission
    pub async fn admit(&self) -> Admission {
        let sample = self.monitor.sample().await;
        let throttled = should_throttle(&sample, &self.config);
        if throttled {
            self.throttled.fetch_add(1, Ordering::Relaxed);
        }
        Admission {
            throttled,
            level: self.monitor.load_level(),
            sample,
        }
    }

    /// Admit a request and wait for a worker slot.
    ///
    /// A throttled admission is delayed, never rejected.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<WorkerPermit, AcquireError> {
        let admission = self.admit().await;
        if admission.throttled {
            debug!(
                cpu = admission.sample.cpu_percent,
                memory = admission.sample.memory_percent,
                delay_ms = self.config.throttle_delay_ms,
                "host saturated, throttling admission"
            );
            tokio::time::sleep(self.config.throttle_delay()).await;
        }

        let pool = self.pool_for(admission.level);
        let permit = pool.semaphore.clone().acquire_owned().await?;
        self.active.fetch_add(1, Ordering::AcqRel);

        Ok(WorkerPermit {
            _permit: permit,
            active: self.active.clone(),
            pool_size: pool.size,
            level: admission.level,
        })
    }

    /// Run `op` up to `compile_attempts` times while `retryable` accepts its
    /// error, with a fixed backoff between attempts
    pub async fn with_retries<T, E, F, Fut>(&self, retryable: impl Fn(&E) -> bool, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.config.compile_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Err(e) if attempt < attempts && retryable(&e) => {
                    warn!(attempt, attempts, "retrying after host-level timeout");
                    tokio::time::sleep(self.config.retry_backoff()).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let pool = self.current_pool();
        SchedulerStats {
            cpus: self.cpus,
            pool_size: pool.size,
            pool_generation: pool.generation,
            active_workers: self.active.load(Ordering::Acquire),
            load_level: self.monitor.load_level(),
            throttled_admissions: self.throttled.load(Ordering::Relaxed),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn current_pool(&self) -> Arc<WorkerPool> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Current pool, recreated if its size no longer fits `level`
    fn pool_for(&self, level: LoadLevel) -> Arc<WorkerPool> {
        let wanted = pool_size(level, self.cpus);
        let current = self.current_pool();
        if current.size == wanted {
            return current;
        }

        let mut pool = self.pool.write().unwrap_or_else(|e| e.into_inner());
        if pool.size != wanted {
            let generation = pool.generation + 1;
            info!(%level, old_size = pool.size, new_size = wanted, generation, "recreating worker pool");
            *pool = Arc::new(WorkerPool::new(wanted, generation));
        }
        pool.clone()
    }
}
