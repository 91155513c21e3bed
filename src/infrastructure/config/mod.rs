//! Configuration management infrastructure
//!
//! Layered configuration using figment: defaults, project YAML files and
//! `TASKLOOM_*` environment overrides, validated after extraction.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
