use orchcore::{Task, TaskOutput};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cache key derived from task kind, payload and required capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    pub fn of(task: &Task) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(task.kind.as_bytes());
        hasher.update(&[0]);
        // serde_json maps serialize with sorted keys
        hasher.update(task.payload.to_string().as_bytes());
        hasher.update(&[0]);
        for capability in &task.required_capabilities {
            hasher.update(capability.as_bytes());
            hasher.update(&[0]);
        }
        Self(hasher.finalize())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
            ttl_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct CacheEntry {
    output: TaskOutput,
    inserted_at: Instant,
    tick: u64,
}

struct CacheState {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Access tick -> key, oldest first
    recency: BTreeMap<u64, Fingerprint>,
    next_tick: u64,
    stats: CacheStats,
}

impl CacheState {
    fn touch(&mut self, key: Fingerprint) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(&key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key);
        }
    }

    fn evict(&mut self, key: &Fingerprint) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
        }
    }
}

/// LRU result cache with TTL expiry
///
/// Only tasks marked cacheable are ever looked up or stored.
pub struct ResultCache {
    state: Mutex<CacheState>,
    capacity: usize,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                stats: CacheStats::default(),
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, Duration::from_millis(config.ttl_ms))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, task: &Task) -> Option<TaskOutput> {
        if !task.cacheable {
            return None;
        }
        self.get_by_key(Fingerprint::of(task))
    }

    pub fn get_by_key(&self, key: Fingerprint) -> Option<TaskOutput> {
        let mut guard = self.state();
        let state = &mut *guard;
        let expired = match state.entries.get(&key) {
            None => {
                state.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
        };

        if expired {
            state.evict(&key);
            state.stats.misses += 1;
            return None;
        }

        state.touch(key);
        state.stats.hits += 1;
        state.entries.get(&key).map(|e| e.output.clone())
    }

    pub fn put(&self, task: &Task, output: TaskOutput) {
        if !task.cacheable {
            return;
        }
        self.put_by_key(Fingerprint::of(task), output);
    }

    pub fn put_by_key(&self, key: Fingerprint, output: TaskOutput) {
        let mut guard = self.state();
        let state = &mut *guard;

        if state.entries.contains_key(&key) {
            state.evict(&key);
        }

        while state.entries.len() >= self.capacity {
            let oldest = match state.recency.iter().next() {
                Some((_, key)) => *key,
                None => break,
            };
            state.evict(&oldest);
            state.stats.evictions += 1;
        }

        let tick = state.next_tick;
        state.next_tick += 1;
        state.entries.insert(
            key,
            CacheEntry {
                output,
                inserted_at: Instant::now(),
                tick,
            },
        );
        state.recency.insert(tick, key);
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let mut guard = self.state();
        let state = &mut *guard;
        let expired: Vec<Fingerprint> = state
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() >= self.ttl)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            state.evict(key);
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }
}
