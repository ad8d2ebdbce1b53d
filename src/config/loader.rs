use super::types::OrchestratorConfig;
use crate::error::{Error, Result};
use config::{Config, Environment, File};
use std::path::PathBuf;

/// Environment variable prefix, e.g. `MCP_ORCHESTRATOR_KUBERNETES__NAMESPACE`
pub const ENV_PREFIX: &str = "MCP_ORCHESTRATOR";

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    config_file: Option<PathBuf>,
    load_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_file: None,
            load_env: false,
        }
    }

    /// Load configuration from file
    pub fn load_from_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }

    /// Load configuration from environment variables
    pub fn load_from_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> Result<OrchestratorConfig> {
        let defaults = Config::try_from(&OrchestratorConfig::default())
            .map_err(|e| Error::Config(format!("Failed to serialize defaults: {}", e)))?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = &self.config_file {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        } else {
            // Try to load from standard locations
            builder = builder
                .add_source(File::with_name("mcp-orchestrator").required(false))
                .add_source(File::with_name("config/mcp-orchestrator").required(false));
        }

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize configuration: {}", e)))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
