use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    calibration::PatternHistoryStore, detection::MacroTable, error::HarnessError,
    suite::DEFAULT_PROVIDER_CONCURRENCY,
};

pub const ENV_REPORTS_DIR: &str = "AGENTPROBE_REPORTS_DIR";
pub const ENV_MAX_TURNS: &str = "AGENTPROBE_MAX_TURNS";
pub const ENV_MODEL_TIMEOUT_MS: &str = "AGENTPROBE_MODEL_TIMEOUT_MS";

/// Harness-wide settings: where reports live, run limits, provider
/// concurrency and the global macro table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub reports_root: PathBuf,
    pub default_max_turns: usize,
    pub model_timeout_ms: Option<u64>,
    pub default_concurrency: usize,
    pub provider_concurrency: BTreeMap<String, usize>,
    pub macros: BTreeMap<String, String>,
    pub record_calibration: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            reports_root: PathBuf::from("reports"),
            default_max_turns: 8,
            model_timeout_ms: Some(60_000),
            default_concurrency: DEFAULT_PROVIDER_CONCURRENCY,
            provider_concurrency: BTreeMap::new(),
            macros: BTreeMap::new(),
            record_calibration: true,
        }
    }
}

impl HarnessConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Reads the file when given (defaults otherwise), then applies the
    /// process environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self, HarnessError> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
                Self::from_yaml_str(&text).map_err(|source| HarnessError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), HarnessError> {
        if let Some(dir) = lookup(ENV_REPORTS_DIR).filter(|v| !v.trim().is_empty()) {
            debug!(reports_root = %dir, "reports root from environment");
            self.reports_root = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_MAX_TURNS) {
            self.default_max_turns = raw.trim().parse().map_err(|_| {
                HarnessError::Config(format!("{ENV_MAX_TURNS} must be a positive integer, got {raw:?}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_MODEL_TIMEOUT_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                HarnessError::Config(format!("{ENV_MODEL_TIMEOUT_MS} must be milliseconds, got {raw:?}"))
            })?;
            self.model_timeout_ms = (ms > 0).then_some(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.default_max_turns == 0 {
            return Err(HarnessError::Config("default_max_turns must be positive".to_string()));
        }
        if self.default_concurrency == 0 {
            return Err(HarnessError::Config("default_concurrency must be positive".to_string()));
        }
        if let Some((key, _)) = self.provider_concurrency.iter().find(|(_, limit)| **limit == 0) {
            return Err(HarnessError::Config(format!(
                "provider_concurrency for {key} must be positive"
            )));
        }
        Ok(())
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.reports_root.join("runs")
    }

    pub fn history_store(&self) -> PatternHistoryStore {
        PatternHistoryStore::under_reports(&self.reports_root)
    }

    pub fn macro_table(&self) -> MacroTable {
        MacroTable::from(self.macros.clone())
    }

    pub fn concurrency_for(&self, provider_key: &str) -> usize {
        self.provider_concurrency
            .get(provider_key)
            .copied()
            .unwrap_or(self.default_concurrency)
    }
}
