use crate::loader::WorkerManifest;
use orchcore::{
    OrchError, ReleaseMetrics, Worker, WorkerId, WorkerMetrics, WorkerStatus,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tokio::sync::{Mutex, Notify};

/// Weight of the newest outcome in the success-rate moving average
const SUCCESS_EMA_ALPHA: f64 = 0.3;

/// Idle time at which the recency term reaches one half
const RECENCY_HALF_LIFE_SECS: f64 = 30.0;

const WEIGHT_SUCCESS: f64 = 0.5;
const WEIGHT_SPEED: f64 = 0.3;
const WEIGHT_RECENCY: f64 = 0.2;

/// Keyword rules used to place workers into teams
#[derive(Debug, Clone, Default)]
pub struct TeamRules {
    pub teams: BTreeMap<String, Vec<String>>,
    pub default_team: String,
}

impl TeamRules {
    pub fn new(default_team: impl Into<String>) -> Self {
        Self {
            teams: BTreeMap::new(),
            default_team: default_team.into(),
        }
    }

    pub fn with_team<I, S>(mut self, team: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.teams
            .insert(team.into(), keywords.into_iter().map(Into::into).collect());
        self
    }

    /// Team whose keyword gives the longest match against any capability
    pub fn assign(&self, capabilities: &BTreeSet<String>) -> String {
        let mut best: Option<(&str, usize)> = None;

        for capability in capabilities {
            let capability = capability.to_lowercase();
            for (team, keywords) in &self.teams {
                for keyword in keywords {
                    let keyword = keyword.to_lowercase();
                    if keyword.is_empty() || !capability.contains(&keyword) {
                        continue;
                    }
                    if best.map_or(true, |(_, len)| keyword.len() > len) {
                        best = Some((team.as_str(), keyword.len()));
                    }
                }
            }
        }

        best.map(|(team, _)| team.to_string())
            .unwrap_or_else(|| self.default_team.clone())
    }
}

struct Entry {
    worker: Worker,
    last_released: Option<Instant>,
}

/// Tracks known workers, their live status and performance
///
/// All mutation happens behind a single mutex so that acquisition and the
/// idle -> busy flip are one atomic step.
pub struct WorkerRegistry {
    entries: Mutex<Vec<Entry>>,
    released: Notify,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            released: Notify::new(),
        }
    }

    /// Populate workers from a capability manifest
    ///
    /// Returns the number of newly registered workers. Known IDs are skipped;
    /// use [`WorkerRegistry::reload`] to refresh them.
    pub async fn discover(&self, manifest: &WorkerManifest) -> usize {
        let rules = manifest.team_rules();
        let mut entries = self.entries.lock().await;
        let mut added = 0;

        for def in &manifest.workers {
            if entries.iter().any(|e| e.worker.id == def.id) {
                tracing::debug!("Worker {} already registered, skipping", def.id);
                continue;
            }
            let worker = def.to_worker(&rules);
            tracing::info!("Discovered worker {} (team: {})", worker.id, worker.team);
            entries.push(Entry {
                worker,
                last_released: None,
            });
            added += 1;
        }

        added
    }

    /// Explicit refresh from a manifest, decoupled from dispatch
    ///
    /// New workers are added; known workers get their capabilities, team and
    /// backend settings updated while status and performance are preserved.
    /// Workers missing from the manifest are left in place.
    pub async fn reload(&self, manifest: &WorkerManifest) -> usize {
        let rules = manifest.team_rules();
        let mut entries = self.entries.lock().await;
        let mut changed = 0;

        for def in &manifest.workers {
            let fresh = def.to_worker(&rules);
            match entries.iter_mut().find(|e| e.worker.id == def.id) {
                Some(entry) => {
                    entry.worker.name = fresh.name;
                    entry.worker.capabilities = fresh.capabilities;
                    entry.worker.team = fresh.team;
                    entry.worker.backend = fresh.backend;
                    entry.worker.config = fresh.config;
                }
                None => entries.push(Entry {
                    worker: fresh,
                    last_released: None,
                }),
            }
            changed += 1;
        }

        tracing::info!("Reloaded {} worker definitions", changed);
        changed
    }

    /// Register a single worker directly
    pub async fn register(&self, worker: Worker) -> Result<(), OrchError> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.worker.id == worker.id) {
            return Err(OrchError::Manifest(format!(
                "Worker {} already registered",
                worker.id
            )));
        }
        entries.push(Entry {
            worker,
            last_released: None,
        });
        Ok(())
    }

    /// Administrative removal; busy workers cannot be removed
    pub async fn remove(&self, id: &str) -> Result<Worker, OrchError> {
        let mut entries = self.entries.lock().await;
        let pos = entries
            .iter()
            .position(|e| e.worker.id == id)
            .ok_or_else(|| OrchError::WorkerUnavailable(id.to_string()))?;

        if !entries[pos].worker.is_idle() {
            return Err(OrchError::Execution(format!(
                "Worker {} is busy and cannot be removed",
                id
            )));
        }

        tracing::info!("Removed worker {}", id);
        Ok(entries.remove(pos).worker)
    }

    /// Reserve an idle worker able to serve `required`
    ///
    /// The preferred worker wins when it is idle and capable; otherwise the
    /// highest-scoring idle candidate is taken, ties going to the earliest
    /// registered. Returns `None` when no eligible worker is idle.
    pub async fn acquire(
        &self,
        preferred: Option<&str>,
        required: &BTreeSet<String>,
    ) -> Option<WorkerId> {
        let mut entries = self.entries.lock().await;

        if let Some(id) = preferred {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.worker.id == id && e.worker.is_idle() && e.worker.has_capabilities(required))
            {
                return Some(Self::reserve(entry));
            }
        }

        let now = Instant::now();
        let max_avg = entries
            .iter()
            .filter(|e| e.worker.is_idle() && e.worker.has_capabilities(required))
            .map(|e| e.worker.performance.avg_response_time_ms)
            .fold(0.0_f64, f64::max);

        let mut best: Option<(usize, f64)> = None;
        for (pos, entry) in entries.iter().enumerate() {
            if !entry.worker.is_idle() || !entry.worker.has_capabilities(required) {
                continue;
            }
            let score = Self::score(entry, max_avg, now);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((pos, score));
            }
        }

        best.map(|(pos, _)| Self::reserve(&mut entries[pos]))
    }

    /// Reserve exactly `id` if it is idle; no fallback to other workers
    pub async fn try_acquire(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries
            .iter_mut()
            .find(|e| e.worker.id == id && e.worker.is_idle())
        {
            Some(entry) => {
                Self::reserve(entry);
                true
            }
            None => false,
        }
    }

    fn reserve(entry: &mut Entry) -> WorkerId {
        entry.worker.status = WorkerStatus::Busy;
        entry.worker.workload += 1;
        tracing::debug!("Acquired worker {}", entry.worker.id);
        entry.worker.id.clone()
    }

    fn score(entry: &Entry, max_avg: f64, now: Instant) -> f64 {
        let perf = &entry.worker.performance;
        let speed = if max_avg > 0.0 {
            1.0 - perf.avg_response_time_ms / max_avg
        } else {
            1.0
        };
        let recency = match entry.last_released {
            None => 1.0,
            Some(at) => {
                let idle = now.saturating_duration_since(at).as_secs_f64();
                idle / (idle + RECENCY_HALF_LIFE_SECS)
            }
        };
        WEIGHT_SUCCESS * perf.success_rate + WEIGHT_SPEED * speed + WEIGHT_RECENCY * recency
    }

    /// Return a worker to the idle pool and fold the outcome into its stats
    pub async fn release(&self, id: &str, metrics: ReleaseMetrics) -> Result<(), OrchError> {
        {
            let mut entries = self.entries.lock().await;
            let entry = entries
                .iter_mut()
                .find(|e| e.worker.id == id)
                .ok_or_else(|| OrchError::WorkerUnavailable(id.to_string()))?;

            if entry.worker.is_idle() {
                tracing::warn!("Release of idle worker {} ignored", id);
                return Ok(());
            }

            let perf = &mut entry.worker.performance;
            perf.completed_invocations += 1;
            let n = perf.completed_invocations as f64;
            perf.avg_response_time_ms += (metrics.duration_ms as f64 - perf.avg_response_time_ms) / n;
            let outcome = if metrics.success { 1.0 } else { 0.0 };
            perf.success_rate = SUCCESS_EMA_ALPHA * outcome + (1.0 - SUCCESS_EMA_ALPHA) * perf.success_rate;

            entry.worker.status = WorkerStatus::Idle;
            entry.last_released = Some(Instant::now());
            tracing::debug!(
                "Released worker {} ({}ms, success: {})",
                id,
                metrics.duration_ms,
                metrics.success
            );
        }

        self.released.notify_waiters();
        Ok(())
    }

    /// Resolves on the next release of any worker
    pub async fn wait_for_release(&self) {
        self.released.notified().await;
    }

    /// Whether any registered worker, idle or busy, can serve `required`
    pub async fn has_capable_worker(&self, required: &BTreeSet<String>) -> bool {
        self.entries
            .lock()
            .await
            .iter()
            .any(|e| e.worker.has_capabilities(required))
    }

    pub async fn get(&self, id: &str) -> Option<Worker> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.worker.id == id)
            .map(|e| e.worker.clone())
    }

    /// All workers in registration order
    pub async fn workers(&self) -> Vec<Worker> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.worker.clone())
            .collect()
    }

    pub async fn metrics(&self) -> Vec<WorkerMetrics> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| WorkerMetrics::from(&e.worker))
            .collect()
    }

    pub async fn idle_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.worker.is_idle())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
