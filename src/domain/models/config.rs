use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::conflict::ResolutionStrategy;

/// Main configuration structure for taskloom
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Workflow executor configuration
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Iteration controller configuration
    #[serde(default)]
    pub iteration: IterationConfig,

    /// Conflict resolver configuration
    #[serde(default)]
    pub conflict: ConflictConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to the `SQLite` file. `:memory:` keeps everything in process.
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits on a locked database.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// How long a caller waits for a free pooled connection.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_database_path() -> String {
    ".taskloom/taskloom.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

const fn default_busy_timeout_ms() -> u64 {
    30_000
}

const fn default_acquire_timeout_ms() -> u64 {
    3_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    /// In-process database, mostly for tests.
    pub fn in_memory() -> Self {
        Self {
            path: ":memory:".to_string(),
            max_connections: 1,
            ..Self::default()
        }
    }

    /// Filesystem location, accepting a `sqlite:` URL prefix as well.
    pub fn file_path(&self) -> PathBuf {
        let path = self
            .path
            .strip_prefix("sqlite://")
            .or_else(|| self.path.strip_prefix("sqlite:"))
            .unwrap_or(&self.path);
        PathBuf::from(path)
    }

    pub fn is_in_memory(&self) -> bool {
        self.file_path().as_os_str() == ":memory:"
    }

    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Log file rotation policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    #[default]
    Daily,
    Hourly,
    Never,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub format: LogFormat,

    /// Directory for log files. Stdout only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Rotation policy for file output
    #[serde(default)]
    pub rotation: RotationPolicy,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            log_dir: None,
            rotation: RotationPolicy::default(),
        }
    }
}

/// Workflow executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowConfig {
    /// Maximum steps running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Step timeout used when a step does not set one
    #[serde(default = "default_step_timeout_ms")]
    pub default_timeout_ms: u64,

    /// First retry delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for a single retry delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor between retry delays (>= 1.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Number of finished executions kept in the orchestrator history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

const fn default_max_concurrency() -> usize {
    4
}

const fn default_step_timeout_ms() -> u64 {
    30_000
}

const fn default_initial_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_history_limit() -> usize {
    100
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_timeout_ms: default_step_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            history_limit: default_history_limit(),
        }
    }
}

/// Iteration controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IterationConfig {
    /// Hard cap on iterations per loop
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock budget for one loop in seconds
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Consecutive degradations tolerated before terminating
    #[serde(default = "default_max_degradations")]
    pub max_degradations: u32,

    /// Score drop that counts as a degradation
    #[serde(default = "default_degradation_margin")]
    pub degradation_margin: f64,

    /// Score change below which the loop is considered plateaued
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,

    /// Minimum time between two adaptations
    #[serde(default)]
    pub adaptation_cooldown_ms: u64,

    /// Per-iteration execution timeout in seconds (0 disables it)
    #[serde(default)]
    pub iteration_timeout_secs: u64,
}

const fn default_max_iterations() -> u32 {
    5
}

const fn default_max_duration_secs() -> u64 {
    600
}

const fn default_max_degradations() -> u32 {
    2
}

const fn default_degradation_margin() -> f64 {
    0.05
}

const fn default_convergence_threshold() -> f64 {
    0.01
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_duration_secs: default_max_duration_secs(),
            max_degradations: default_max_degradations(),
            degradation_margin: default_degradation_margin(),
            convergence_threshold: default_convergence_threshold(),
            adaptation_cooldown_ms: 0,
            iteration_timeout_secs: 0,
        }
    }
}

impl IterationConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn adaptation_cooldown(&self) -> Duration {
        Duration::from_millis(self.adaptation_cooldown_ms)
    }

    pub fn iteration_timeout(&self) -> Option<Duration> {
        (self.iteration_timeout_secs > 0).then(|| Duration::from_secs(self.iteration_timeout_secs))
    }
}

/// Conflict resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConflictConfig {
    /// Items below this confidence are ignored during detection
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Threshold used by the single high-confidence source rule
    #[serde(default = "default_high_confidence_threshold")]
    pub high_confidence_threshold: f64,

    /// Strategy used when a caller does not request one
    #[serde(default)]
    pub default_strategy: ResolutionStrategy,

    /// Sources preferred by the trusted-source rule
    #[serde(default)]
    pub trusted_sources: Vec<String>,

    /// Static source priority table for `priority_source`
    #[serde(default)]
    pub source_priorities: HashMap<String, i64>,
}

const fn default_min_confidence() -> f64 {
    0.3
}

const fn default_high_confidence_threshold() -> f64 {
    0.9
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            high_confidence_threshold: default_high_confidence_threshold(),
            default_strategy: ResolutionStrategy::default(),
            trusted_sources: Vec::new(),
            source_priorities: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.workflow.max_concurrency, 4);
        assert_eq!(config.iteration.max_iterations, 5);
        assert!((config.conflict.high_confidence_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.iteration.iteration_timeout(), None);
        assert_eq!(config.database.file_path(), PathBuf::from(".taskloom/taskloom.db"));
        assert_eq!(config.database.busy_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_database_path_accepts_url_prefix() {
        let mut database = DatabaseConfig::default();
        database.path = "sqlite://data/state.db".to_string();
        assert_eq!(database.file_path(), PathBuf::from("data/state.db"));
        assert!(!database.is_in_memory());

        database.path = "sqlite::memory:".to_string();
        assert!(database.is_in_memory());
        assert!(DatabaseConfig::in_memory().is_in_memory());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "workflow:\n  max_concurrency: 8\nlogging:\n  format: pretty\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workflow.max_concurrency, 8);
        assert_eq!(config.workflow.default_timeout_ms, 30_000);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.logging.rotation, RotationPolicy::Daily);
    }
}
