//! Error types for the MCP server runtime orchestrator.

use crate::orchestrator::ClusterError;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for orchestrator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Cluster API error
    #[error("Kubernetes API error: {0}")]
    Cluster(#[from] ClusterError),

    /// Invalid or unreadable kubeconfig, shown to the operator as-is
    #[error("❌ {0}")]
    Kubeconfig(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cluster clients were never created
    #[error("Kubernetes runtime is not initialized")]
    NotInitialized,

    /// Server has nothing to build a workload from
    #[error("MCP server {0} has no local configuration")]
    MissingLocalConfig(String),

    /// Workload can't start and won't recover on its own
    #[error("Deployment failed ({reason}): {message}")]
    WorkloadFailed { reason: String, message: String },

    /// Readiness polling ran out of attempts
    #[error("Deployment {name} did not become ready after {attempts} attempts")]
    ReadinessTimeout { name: String, attempts: u32 },

    /// Logical server missing from the database
    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    /// No live pod backs the deployment
    #[error("No running pod found for deployment {0}")]
    NoRunningPod(String),

    /// Log stream broke mid-way
    #[error("Log stream error: {0}")]
    LogStream(String),

    /// Server repository or secrets manager failure
    #[error("Store error: {0}")]
    Store(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Not-found at the cluster boundary
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Cluster(e) if e.is_not_found())
    }
}
