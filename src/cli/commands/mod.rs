//! CLI command implementations.

pub mod config;
pub mod execution;
pub mod task;
pub mod workflow;
