//! Host load sampling
//!
//! [`ResourceMonitor`] keeps rolling windows of CPU and memory usage and
//! classifies them into a [`LoadLevel`] for the scheduler.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::process::procfs;

/// Coarse host pressure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    Normal,
    Medium,
    High,
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadLevel::Normal => "normal",
            LoadLevel::Medium => "medium",
            LoadLevel::High => "high",
        };
        f.write_str(name)
    }
}

/// Classify a usage percentage against the medium/high thresholds
pub fn classify(usage_percent: f64, medium: f64, high: f64) -> LoadLevel {
    if usage_percent > high {
        LoadLevel::High
    } else if usage_percent > medium {
        LoadLevel::Medium
    } else {
        LoadLevel::Normal
    }
}

/// One reading of host usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_available_mb: u64,
}

/// Source of host load readings.
///
/// `sample` may block for its measurement window; callers run it off the
/// async executor.
pub trait LoadProbe: Send + Sync {
    fn sample(&self) -> io::Result<LoadSample>;
}

/// Reads `/proc/stat` twice across a short window, then `/proc/meminfo`
#[derive(Debug, Clone)]
pub struct ProcProbe {
    window: Duration,
}

impl ProcProbe {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl LoadProbe for ProcProbe {
    fn sample(&self) -> io::Result<LoadSample> {
        let before = procfs::read_cpu_times()?;
        std::thread::sleep(self.window);
        let after = procfs::read_cpu_times()?;
        let memory = procfs::read_meminfo()?;

        Ok(LoadSample {
            cpu_percent: after.busy_percent_since(&before),
            memory_percent: memory.used_percent(),
            memory_available_mb: memory.available_kb / 1024,
        })
    }
}

#[derive(Debug, Default)]
struct Windows {
    cpu: VecDeque<f64>,
    memory: VecDeque<f64>,
    last: Option<LoadSample>,
}

/// Rolling view of host load
pub struct ResourceMonitor {
    probe: Arc<dyn LoadProbe>,
    capacity: usize,
    medium_threshold: f64,
    high_threshold: f64,
    windows: Mutex<Windows>,
}

impl fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("capacity", &self.capacity)
            .field("medium_threshold", &self.medium_threshold)
            .field("high_threshold", &self.high_threshold)
            .finish_non_exhaustive()
    }
}

impl ResourceMonitor {
    /// Monitor backed by `/proc`
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_probe(config, Arc::new(ProcProbe::default()))
    }

    pub fn with_probe(config: &SchedulerConfig, probe: Arc<dyn LoadProbe>) -> Self {
        Self {
            probe,
            capacity: config.window.max(1),
            medium_threshold: config.medium_threshold,
            high_threshold: config.high_threshold,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Take one reading and append it to the windows.
    ///
    /// Blocks a worker thread for the probe's window. A failed probe is
    /// logged and the previous reading reused.
    pub async fn sample(&self) -> LoadSample {
        let probe = self.probe.clone();
        let sample = match tokio::task::spawn_blocking(move || probe.sample()).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to sample host load");
                return self.last_sample();
            }
            Err(e) => {
                warn!(error = %e, "host load probe panicked");
                return self.last_sample();
            }
        };

        self.record(sample);
        debug!(
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            available_mb = sample.memory_available_mb,
            "sampled host load"
        );
        sample
    }

    /// Append a reading, evicting the oldest once the window is full
    pub fn record(&self, sample: LoadSample) {
        let mut windows = self.lock();
        push_bounded(&mut windows.cpu, sample.cpu_percent, self.capacity);
        push_bounded(&mut windows.memory, sample.memory_percent, self.capacity);
        windows.last = Some(sample);
    }

    /// Most recent reading, zeroed before the first sample
    pub fn last_sample(&self) -> LoadSample {
        self.lock().last.unwrap_or_default()
    }

    /// Rolling averages of CPU and memory usage
    pub fn averages(&self) -> (f64, f64) {
        let windows = self.lock();
        (average(&windows.cpu), average(&windows.memory))
    }

    /// Number of readings currently held
    pub fn len(&self) -> usize {
        self.lock().cpu.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load level from the rolling averages; the busier resource decides
    pub fn load_level(&self) -> LoadLevel {
        let (cpu, memory) = self.averages();
        classify(cpu.max(memory), self.medium_threshold, self.high_threshold)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Windows> {
        // Samples are plain numbers; a poisoned lock still holds usable data
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64, capacity: usize) {
    while window.len() >= capacity {
        window.pop_front();
    }
    window.push_back(value);
}

fn average(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    }
}
