//! Configuration CLI commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the merged configuration
    Show,
    /// Validate the merged configuration
    Check,
}

#[derive(Debug, Serialize)]
struct ConfigShowOutput {
    #[serde(flatten)]
    config: Config,
    #[serde(skip)]
    rendered: String,
}

impl CommandOutput for ConfigShowOutput {
    fn to_human(&self) -> String {
        self.rendered.clone()
    }
}

#[derive(Debug, Serialize)]
struct ConfigCheckOutput {
    valid: bool,
    error: Option<String>,
}

impl CommandOutput for ConfigCheckOutput {
    fn to_human(&self) -> String {
        match &self.error {
            None => "Configuration is valid.".to_string(),
            Some(error) => format!("Configuration is invalid: {error}"),
        }
    }
}

pub async fn execute(args: ConfigArgs, config: &Config, json_mode: bool) -> Result<()> {
    match args.command {
        ConfigCommands::Show => {
            let rendered = serde_yaml::to_string(config).context("Failed to render configuration")?;
            output(
                &ConfigShowOutput {
                    config: config.clone(),
                    rendered,
                },
                json_mode,
            );
            Ok(())
        }
        ConfigCommands::Check => {
            let result = ConfigLoader::validate(config);
            let out = ConfigCheckOutput {
                valid: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            };
            output(&out, json_mode);
            if out.valid {
                Ok(())
            } else {
                anyhow::bail!("configuration failed validation")
            }
        }
    }
}
