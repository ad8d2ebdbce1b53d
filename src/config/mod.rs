//! Configuration management

mod loader;
mod types;

pub use loader::{ConfigLoader, ENV_PREFIX};
pub use types::{
    KubernetesConfig, LogFormat, LogRotation, LoggingSettings, OrchestratorConfig,
    ResourceRequests, RuntimeSettings,
};
