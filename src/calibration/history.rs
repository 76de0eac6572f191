//! Persisted per-pattern accuracy statistics.
//!
//! The whole history is one JSON document. Every update re-reads the file,
//! applies the new observations and atomically replaces it while holding both
//! an in-process mutex and a `.lock` file next to the document, so concurrent
//! runs in one process or across processes serialize their writes.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{error::HarnessError, persist};

pub const HISTORY_VERSION: u32 = 1;
pub const MAX_OBSERVATION_RECORDS: usize = 500;

const LOCK_RETRY: Duration = Duration::from_millis(25);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const STALE_LOCK: Duration = Duration::from_secs(30);

static PROCESS_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// `"{clause_type}:{12 hex chars}"`, stable across runs and processes.
pub fn pattern_key(clause_type: &str, pattern: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(clause_type.as_bytes());
    hasher.update([0x1f]);
    hasher.update(pattern.as_bytes());
    let digest = hasher.finalize();
    let short: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("{clause_type}:{short}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternHistoryEntry {
    pub key: String,
    pub clause_type: String,
    pub pattern: String,
    pub total_evaluations: u64,
    pub match_count: u64,
    pub correct: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub unsupported_cooccurrences: u64,
    pub accuracy: f64,
    pub false_positive_rate: f64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PatternHistoryEntry {
    pub fn new(clause_type: &str, pattern: &str) -> Self {
        Self {
            key: pattern_key(clause_type, pattern),
            clause_type: clause_type.to_string(),
            pattern: pattern.to_string(),
            total_evaluations: 0,
            match_count: 0,
            correct: 0,
            true_positives: 0,
            false_positives: 0,
            unsupported_cooccurrences: 0,
            accuracy: 0.0,
            false_positive_rate: 0.0,
            first_seen: None,
            last_seen: None,
        }
    }

    /// Inapplicable observations leave the counters untouched.
    fn apply(&mut self, obs: &PatternObservation, at: DateTime<Utc>) {
        if !obs.applicable {
            return;
        }
        let expected = obs.ground_truth;
        self.total_evaluations += 1;
        if obs.matched {
            self.match_count += 1;
            if expected {
                self.true_positives += 1;
            } else {
                self.false_positives += 1;
            }
        }
        if obs.matched == expected {
            self.correct += 1;
        }
        if obs.unsupported_in_expression {
            self.unsupported_cooccurrences += 1;
        }

        self.accuracy = self.correct as f64 / self.total_evaluations as f64;
        self.false_positive_rate = if self.match_count == 0 {
            0.0
        } else {
            self.false_positives as f64 / self.match_count as f64
        };
        self.first_seen.get_or_insert(at);
        self.last_seen = Some(at);
    }
}

/// One atomic clause outcome together with the verdict of the expression it
/// belonged to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternObservation {
    pub clause_type: String,
    pub pattern: String,
    pub matched: bool,
    pub applicable: bool,
    /// Label produced by the whole expression. Treated as negative when the
    /// clause itself was not applicable.
    pub ground_truth: bool,
    #[serde(default)]
    pub unsupported_in_expression: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub key: String,
    pub run_id: String,
    pub scenario_id: String,
    pub clause_type: String,
    pub pattern: String,
    pub matched: bool,
    pub applicable: bool,
    pub ground_truth: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternHistory {
    pub version: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: BTreeMap<String, PatternHistoryEntry>,
    /// Most recent raw observations, oldest first.
    #[serde(default)]
    pub observations: Vec<ObservationRecord>,
}

impl Default for PatternHistory {
    fn default() -> Self {
        Self {
            version: HISTORY_VERSION,
            updated_at: None,
            entries: BTreeMap::new(),
            observations: Vec::new(),
        }
    }
}

impl PatternHistory {
    pub fn entry(&self, clause_type: &str, pattern: &str) -> Option<&PatternHistoryEntry> {
        self.entries.get(&pattern_key(clause_type, pattern))
    }

    pub fn apply(&mut self, observations: &[PatternObservation], run_id: &str, scenario_id: &str) {
        let now = Utc::now();
        for obs in observations {
            let key = pattern_key(&obs.clause_type, &obs.pattern);
            self.entries
                .entry(key.clone())
                .or_insert_with(|| PatternHistoryEntry::new(&obs.clause_type, &obs.pattern))
                .apply(obs, now);
            self.observations.push(ObservationRecord {
                key,
                run_id: run_id.to_string(),
                scenario_id: scenario_id.to_string(),
                clause_type: obs.clause_type.clone(),
                pattern: obs.pattern.clone(),
                matched: obs.matched,
                applicable: obs.applicable,
                ground_truth: obs.applicable && obs.ground_truth,
                recorded_at: now,
            });
        }
        if self.observations.len() > MAX_OBSERVATION_RECORDS {
            let excess = self.observations.len() - MAX_OBSERVATION_RECORDS;
            self.observations.drain(..excess);
        }
        self.updated_at = Some(now);
    }
}

/// File-backed history with a cache of the last successfully read or written
/// document.
#[derive(Debug)]
pub struct PatternHistoryStore {
    path: PathBuf,
    cache: Mutex<Option<PatternHistory>>,
}

impl PatternHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// `<reports_root>/calibration/pattern_history.json`
    pub fn under_reports(reports_root: impl AsRef<Path>) -> Self {
        Self::new(
            reports_root
                .as_ref()
                .join("calibration")
                .join("pattern_history.json"),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cache(&self) -> MutexGuard<'_, Option<PatternHistory>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads the document from disk. Absent means empty; unreadable or corrupt
    /// is an error and the file is left as is.
    pub fn load(&self) -> Result<PatternHistory, HarnessError> {
        let history = read_history(&self.path)?;
        *self.cache() = Some(history.clone());
        Ok(history)
    }

    /// The cached document, loading it on first use.
    pub fn snapshot(&self) -> Result<PatternHistory, HarnessError> {
        if let Some(history) = self.cache().as_ref() {
            return Ok(history.clone());
        }
        self.load()
    }

    pub fn record_observations(
        &self,
        observations: &[PatternObservation],
        run_id: &str,
        scenario_id: &str,
    ) -> Result<PatternHistory, HarnessError> {
        let process_lock = process_lock(&self.path);
        let _held = process_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _file_lock = FileLock::acquire(&self.path)?;

        let mut history = read_history(&self.path)?;
        history.apply(observations, run_id, scenario_id);
        persist::atomic_write_json(&self.path, &history)?;

        info!(
            path = %self.path.display(),
            run_id,
            observations = observations.len(),
            patterns = history.entries.len(),
            "pattern history updated"
        );
        *self.cache() = Some(history.clone());
        Ok(history)
    }
}

fn read_history(path: &Path) -> Result<PatternHistory, HarnessError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(PatternHistory::default()),
        Err(err) => return Err(HarnessError::io(path, err)),
    };
    serde_json::from_slice(&bytes).map_err(|source| HarnessError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn process_lock(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = PROCESS_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Exclusive `<file>.lock` sibling, removed on drop.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(target: &Path) -> Result<Self, HarnessError> {
        let mut name = target.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                persist::ensure_dir(parent)?;
            }
        }

        let started = Instant::now();
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        warn!(lock = %path.display(), "removing stale history lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= LOCK_TIMEOUT {
                        return Err(HarnessError::LockTimeout(path));
                    }
                    debug!(lock = %path.display(), "history lock busy");
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(err) => return Err(HarnessError::io(&path, err)),
            }
        }
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(false, |age| age > STALE_LOCK)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
