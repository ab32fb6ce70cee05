use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FlowError, Result};

/// Top-level tokenflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            engine: EngineConfig::default(),
            snapshot: SnapshotConfig::default(),
            log: LogConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bounded capacity of each run's coordinator mailbox.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    /// Runaway-routing guard. Exceeding it fails the run.
    #[serde(default = "default_max_tokens_per_run")]
    pub max_tokens_per_run: usize,
    /// Remove `_branch.<id>` entries once their group has merged.
    #[serde(default = "default_true")]
    pub dispose_merged_branches: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            event_bus_capacity: default_event_bus_capacity(),
            max_tokens_per_run: default_max_tokens_per_run(),
            dispose_merged_branches: true,
        }
    }
}

/// Context snapshot policy. Any combination may be active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot every N trace events (0 = off).
    #[serde(default)]
    pub every_events: u64,
    /// Snapshot on a wall-clock interval in milliseconds (0 = off).
    #[serde(default)]
    pub interval_ms: u64,
    /// Snapshot right after each fan-in merge.
    #[serde(default = "default_true")]
    pub on_fan_in: bool,
    /// Snapshots kept in memory per run; oldest dropped first.
    #[serde(default = "default_snapshot_retain")]
    pub retain: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            every_events: 0,
            interval_ms: 0,
            on_fan_in: true,
            retain: default_snapshot_retain(),
        }
    }
}

/// JSONL trace log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for trace files. Default: <data_dir>/traces
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = operation, 2 = + decision and dispatch, 3 = + context writes.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: default_log_level(),
        }
    }
}

/// SQLite run store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Database file. Default: <data_dir>/runs.db
    #[serde(default)]
    pub path: Option<String>,
    /// Save the run record after every handled coordinator message.
    #[serde(default = "default_true")]
    pub persist_every_step: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            persist_every_step: true,
        }
    }
}

fn default_true() -> bool { true }
fn default_data_dir() -> String { "~/.tokenflow".to_string() }
fn default_mailbox_capacity() -> usize { 256 }
fn default_event_bus_capacity() -> usize { 1024 }
fn default_max_tokens_per_run() -> usize { 10_000 }
fn default_snapshot_retain() -> usize { 16 }
fn default_log_level() -> u8 { 2 }

impl FlowConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: FlowConfig =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.engine.mailbox_capacity == 0 {
            return Err(FlowError::Config("engine.mailbox_capacity must be > 0".into()));
        }
        if self.engine.max_tokens_per_run == 0 {
            return Err(FlowError::Config("engine.max_tokens_per_run must be > 0".into()));
        }
        if !(1..=3).contains(&self.log.level) {
            return Err(FlowError::Config(format!(
                "log.level must be 1, 2 or 3 (got {})",
                self.log.level
            )));
        }
        Ok(())
    }

    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.log.log_dir {
            Some(dir) => expand_home(dir),
            None => self.data_dir().join("traces"),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        match &self.store.path {
            Some(p) => expand_home(p),
            None => self.data_dir().join("runs.db"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Substitute `${NAME}` with the value of environment variable `NAME`.
/// Unset or unterminated references are kept as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let reference = &rest[open..];
        let Some(close) = reference.find('}') else {
            out.push_str(reference);
            return out;
        };
        let name = &reference[2..close];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                warn!(variable = name, "Config references an unset environment variable");
                out.push_str(&reference[..=close]);
            }
        }
        rest = &reference[close + 1..];
    }
    out.push_str(rest);
    out
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_TOKENFLOW_VAR", "/tmp/flows");
        let result = expand_env_vars("data_dir = \"${TEST_TOKENFLOW_VAR}\"");
        assert_eq!(result, "data_dir = \"/tmp/flows\"");
        std::env::remove_var("TEST_TOKENFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("path = \"${NONEXISTENT_TOKENFLOW_VAR}\"");
        assert_eq!(result, "path = \"${NONEXISTENT_TOKENFLOW_VAR}\"");
    }

    #[test]
    fn test_expand_env_vars_unterminated() {
        std::env::set_var("TEST_TOKENFLOW_HOST", "db");
        let result = expand_env_vars("a = \"${TEST_TOKENFLOW_HOST}\"\nb = \"${OPEN");
        assert_eq!(result, "a = \"db\"\nb = \"${OPEN");
        std::env::remove_var("TEST_TOKENFLOW_HOST");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = FlowConfig::from_toml("").unwrap();
        assert_eq!(config.engine.mailbox_capacity, 256);
        assert_eq!(config.engine.max_tokens_per_run, 10_000);
        assert!(config.engine.dispose_merged_branches);
        assert_eq!(config.snapshot.every_events, 0);
        assert!(config.snapshot.on_fan_in);
        assert_eq!(config.log.level, 2);
        assert!(!config.store.enabled);
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
data_dir = "/var/lib/tokenflow"

[snapshot]
every_events = 50

[store]
enabled = true
"#;
        let config = FlowConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.snapshot.every_events, 50);
        assert_eq!(config.snapshot.retain, 16);
        assert!(config.store.persist_every_step);
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/tokenflow/runs.db"));
        assert_eq!(config.log_dir(), PathBuf::from("/var/lib/tokenflow/traces"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(FlowConfig::from_toml("[log]\nlevel = 7").is_err());
        assert!(FlowConfig::from_toml("[engine]\nmailbox_capacity = 0").is_err());
        assert!(matches!(
            FlowConfig::from_toml("engine = 3"),
            Err(FlowError::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = FlowConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, FlowError::ConfigNotFound(_)));
        let config = FlowConfig::load_or_default(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(config.data_dir, "~/.tokenflow");
    }
}
