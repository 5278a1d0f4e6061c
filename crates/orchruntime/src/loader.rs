use crate::registry::TeamRules;
use orchcore::{OrchError, Worker, WorkerPerformance, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

/// File name fragments that never describe a worker
pub const EXCLUDED_PATTERNS: &[&str] = &["rca-", "template-", "README", "test-", "draft-"];

/// One worker entry in a capability manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDefinition {
    /// Falls back to the file stem during directory discovery
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Explicit team; derived from capabilities when absent
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl WorkerDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            capabilities: BTreeSet::new(),
            team: None,
            backend: None,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Build an idle worker, placing it into a team
    pub fn to_worker(&self, rules: &TeamRules) -> Worker {
        let team = self
            .team
            .clone()
            .unwrap_or_else(|| rules.assign(&self.capabilities));

        Worker {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| display_name(&self.id)),
            capabilities: self.capabilities.clone(),
            team,
            status: WorkerStatus::Idle,
            workload: 0,
            performance: WorkerPerformance::default(),
            backend: self.backend.clone(),
            config: self.config.clone(),
        }
    }
}

/// "security-architect" -> "Security Architect"
fn display_name(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn default_team() -> String {
    "general".to_string()
}

/// Capability manifest consumed by worker discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerManifest {
    #[serde(default)]
    pub workers: Vec<WorkerDefinition>,
    /// team -> capability keywords
    #[serde(default)]
    pub teams: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_team")]
    pub default_team: String,
    /// Workers that must always be present
    #[serde(default)]
    pub critical_workers: Vec<String>,
    /// Files that could not be read during directory discovery
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid: Vec<InvalidDefinition>,
}

impl Default for WorkerManifest {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            teams: BTreeMap::new(),
            default_team: default_team(),
            critical_workers: Vec::new(),
            invalid: Vec::new(),
        }
    }
}

impl WorkerManifest {
    pub fn with_worker(mut self, worker: WorkerDefinition) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn team_rules(&self) -> TeamRules {
        TeamRules {
            teams: self.teams.clone(),
            default_team: self.default_team.clone(),
        }
    }

    /// Check the manifest for missing critical workers, duplicates and
    /// count mismatches. An empty list means the manifest is complete.
    pub fn validate_completeness(&self, expected_count: Option<usize>) -> Vec<String> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();

        for def in &self.workers {
            if !seen.insert(def.id.as_str()) {
                issues.push(format!("Duplicate worker id: {}", def.id));
            }
        }

        for critical in &self.critical_workers {
            if !seen.contains(critical.as_str()) {
                issues.push(format!("CRITICAL: Missing required worker: {}", critical));
            }
        }

        if let Some(expected) = expected_count {
            if expected != self.workers.len() {
                issues.push(format!(
                    "Expected {} workers, found {}",
                    expected,
                    self.workers.len()
                ));
            }
        }

        for invalid in &self.invalid {
            issues.push(format!(
                "Invalid worker file {}: {}",
                invalid.path.display(),
                invalid.error
            ));
        }

        issues
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidDefinition {
    pub path: PathBuf,
    pub error: String,
}

/// Loads worker manifests from disk
pub struct ManifestLoader;

impl ManifestLoader {
    /// Read a single manifest file
    pub fn load_file(path: impl AsRef<Path>) -> Result<WorkerManifest, OrchError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            OrchError::Manifest(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let manifest: WorkerManifest = serde_json::from_reader(std::io::BufReader::new(file))?;
        tracing::info!(
            "Loaded manifest {} with {} workers",
            path.display(),
            manifest.workers.len()
        );
        Ok(manifest)
    }

    /// Read every `*.json` worker definition in a directory
    ///
    /// Files matching [`EXCLUDED_PATTERNS`] are skipped; unreadable files are
    /// recorded in `invalid` rather than aborting discovery. A `_manifest.json`
    /// file, if present, supplies team rules and critical workers.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<WorkerManifest, OrchError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(OrchError::Manifest(format!(
                "Worker directory not found: {}",
                dir.display()
            )));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension() == Some("json".as_ref()))
            .collect();
        paths.sort();

        let mut manifest = WorkerManifest::default();
        for path in paths {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            if file_name == "_manifest.json" {
                let base = Self::load_file(&path)?;
                manifest.teams = base.teams;
                manifest.default_team = base.default_team;
                manifest.critical_workers = base.critical_workers;
                manifest.workers.extend(base.workers);
                continue;
            }

            if EXCLUDED_PATTERNS.iter().any(|p| file_name.contains(p)) {
                tracing::debug!("Excluding {}", file_name);
                continue;
            }

            match Self::read_definition(&path) {
                Ok(def) => manifest.workers.push(def),
                Err(e) => {
                    tracing::warn!("Error processing {}: {}", path.display(), e);
                    manifest.invalid.push(InvalidDefinition {
                        path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "Discovered {} worker definitions in {}",
            manifest.workers.len(),
            dir.display()
        );
        Ok(manifest)
    }

    fn read_definition(path: &Path) -> Result<WorkerDefinition, OrchError> {
        let content = std::fs::read_to_string(path)?;
        let mut def: WorkerDefinition = serde_json::from_str(&content)?;
        if def.id.trim().is_empty() {
            if let Some(stem) = path.file_stem() {
                def.id = stem.to_string_lossy().into_owned();
            }
        }
        Ok(def)
    }

    /// Load from either a manifest file or a directory of definitions
    pub fn load(path: impl AsRef<Path>) -> Result<WorkerManifest, OrchError> {
        let path = path.as_ref();
        if path.is_dir() {
            Self::load_dir(path)
        } else {
            Self::load_file(path)
        }
    }
}
