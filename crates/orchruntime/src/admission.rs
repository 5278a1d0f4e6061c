use orchcore::Task;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One observation of host resource usage, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

/// Source of resource samples
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Option<ResourceSample>;
}

/// Reads `/proc/meminfo` and `/proc/loadavg`; yields nothing elsewhere
pub struct SystemProbe {
    cpus: usize,
}

impl SystemProbe {
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { cpus }
    }

    fn memory_percent() -> Option<f64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let field = |name: &str| -> Option<f64> {
            meminfo
                .lines()
                .find(|l| l.starts_with(name))?
                .split_whitespace()
                .nth(1)?
                .parse()
                .ok()
        };
        let total = field("MemTotal:")?;
        let available = field("MemAvailable:")?;
        if total <= 0.0 {
            return None;
        }
        Some((total - available) * 100.0 / total)
    }

    fn cpu_percent(&self) -> Option<f64> {
        let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
        let one_minute: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
        Some((one_minute * 100.0 / self.cpus as f64).min(100.0))
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> Option<ResourceSample> {
        Some(ResourceSample {
            memory_percent: Self::memory_percent()?,
            cpu_percent: self.cpu_percent()?,
        })
    }
}

/// Admission thresholds and timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Number of samples in the rolling window
    pub window: usize,
    pub max_memory_percent: f64,
    pub max_cpu_percent: f64,
    pub poll_interval_ms: u64,
    /// Queue wait after which a deferred task fails
    pub max_queue_wait_ms: u64,
    /// Attach a [`SystemProbe`] to the monitor; without a probe the window
    /// stays empty and every task is admitted
    pub sample_system: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window: 10,
            max_memory_percent: 90.0,
            max_cpu_percent: 90.0,
            poll_interval_ms: 100,
            max_queue_wait_ms: 300_000,
            sample_system: true,
        }
    }
}

/// Rolling window of resource samples
pub struct ResourceMonitor {
    samples: Mutex<VecDeque<ResourceSample>>,
    window: usize,
    max_memory_percent: f64,
    max_cpu_percent: f64,
    probe: Option<Arc<dyn ResourceProbe>>,
}

impl ResourceMonitor {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(config.window)),
            window: config.window.max(1),
            max_memory_percent: config.max_memory_percent,
            max_cpu_percent: config.max_cpu_percent,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn record(&self, sample: ResourceSample) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn has_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// Take a sample from the probe, if one is attached
    pub fn refresh(&self) {
        if let Some(sample) = self.probe.as_ref().and_then(|p| p.sample()) {
            self.record(sample);
        }
    }

    /// Mean over the current window
    pub fn average(&self) -> Option<ResourceSample> {
        let samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let (mem, cpu) = samples.iter().fold((0.0, 0.0), |(m, c), s| {
            (m + s.memory_percent, c + s.cpu_percent)
        });
        Some(ResourceSample {
            memory_percent: mem / n,
            cpu_percent: cpu / n,
        })
    }

    /// Healthy when the window average stays under both thresholds.
    /// An empty window counts as healthy.
    pub fn is_healthy(&self) -> bool {
        match self.average() {
            Some(avg) => {
                avg.memory_percent < self.max_memory_percent && avg.cpu_percent < self.max_cpu_percent
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Dispatch,
    Defer,
}

/// Gates dispatch on resource health
pub struct AdmissionControl {
    monitor: ResourceMonitor,
    config: AdmissionConfig,
}

impl AdmissionControl {
    pub fn new(config: AdmissionConfig) -> Self {
        let mut monitor = ResourceMonitor::new(&config);
        if config.sample_system {
            monitor = monitor.with_probe(Arc::new(SystemProbe::new()));
        }
        Self { monitor, config }
    }

    pub fn with_monitor(config: AdmissionConfig, monitor: ResourceMonitor) -> Self {
        Self { monitor, config }
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.config.max_queue_wait_ms)
    }

    /// Queueable tasks are deferred while resources are unhealthy;
    /// the rest dispatch regardless.
    pub fn admit(&self, task: &Task) -> Admission {
        if !task.queueable || self.monitor.is_healthy() {
            Admission::Dispatch
        } else {
            tracing::debug!("Deferring task {}: resources unhealthy", task.id);
            Admission::Defer
        }
    }
}

impl Default for AdmissionControl {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}
