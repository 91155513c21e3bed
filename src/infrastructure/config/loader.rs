use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Project directory holding config files and the default database.
pub const CONFIG_DIR: &str = ".taskloom";

/// Prefix for environment overrides, e.g. `TASKLOOM_WORKFLOW__MAX_CONCURRENCY`.
pub const ENV_PREFIX: &str = "TASKLOOM_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid max_concurrency: {0}. Must be at least 1")]
    InvalidConcurrency(usize),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must not exceed max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid backoff_multiplier: {0}. Must be at least 1.0")]
    InvalidBackoffMultiplier(f64),

    #[error("Invalid max_iterations: {0}. Must be at least 1")]
    InvalidMaxIterations(u32),

    #[error("Invalid {field}: {value}. Must be within [0, 1]")]
    OutOfUnitRange { field: &'static str, value: f64 },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.taskloom/config.yaml`
    /// 3. `.taskloom/local.yaml` (optional local overrides)
    /// 4. `TASKLOOM_*` environment variables, `__` separating sections
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment()
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// The layered provider chain used by [`load`](Self::load).
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(format!("{CONFIG_DIR}/config.yaml")))
            .merge(Yaml::file(format!("{CONFIG_DIR}/local.yaml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from a specific file. Environment overrides still
    /// apply on top.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let path = path.as_ref();
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(0));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let workflow = &config.workflow;
        if workflow.max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(0));
        }
        if workflow.initial_backoff_ms > workflow.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                workflow.initial_backoff_ms,
                workflow.max_backoff_ms,
            ));
        }
        if workflow.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(workflow.backoff_multiplier));
        }
        if workflow.history_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "workflow.history_limit must be at least 1".to_string(),
            ));
        }

        let iteration = &config.iteration;
        if iteration.max_iterations == 0 {
            return Err(ConfigError::InvalidMaxIterations(0));
        }
        if iteration.max_degradations == 0 {
            return Err(ConfigError::ValidationFailed(
                "iteration.max_degradations must be at least 1".to_string(),
            ));
        }

        for (field, value) in [
            ("iteration.degradation_margin", iteration.degradation_margin),
            ("iteration.convergence_threshold", iteration.convergence_threshold),
            ("conflict.min_confidence", config.conflict.min_confidence),
            ("conflict.high_confidence_threshold", config.conflict.high_confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfUnitRange { field, value });
            }
        }

        Ok(())
    }
}
