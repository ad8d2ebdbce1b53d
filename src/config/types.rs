use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Cluster connection
    pub kubernetes: KubernetesConfig,

    /// Workload tunables
    pub runtime: RuntimeSettings,

    /// Logging configuration
    pub logging: LoggingSettings,

    /// Manifest with installed servers, catalog items and secrets
    pub manifest_path: Option<PathBuf>,
}

/// Cluster connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Namespace that holds every managed workload
    pub namespace: String,

    /// Use the in-cluster service account credentials
    pub in_cluster: bool,

    /// Explicit kubeconfig file, validated before use
    pub kubeconfig: Option<PathBuf>,

    /// Name of the platform's own pod (POD_NAME / HOSTNAME when unset)
    pub pod_name: Option<String>,

    /// Label selector used to find the platform pod without an identity hint
    pub platform_pod_selector: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            in_cluster: false,
            kubeconfig: None,
            pod_name: None,
            platform_pod_selector: "app.kubernetes.io/name=mcp-platform".to_string(),
        }
    }
}

impl KubernetesConfig {
    /// Identity hint for "which pod am I"
    pub fn platform_pod_name(&self) -> Option<String> {
        self.pod_name
            .clone()
            .or_else(|| std::env::var("POD_NAME").ok())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|name| !name.is_empty())
    }
}

/// Tunables for managed workloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Image used when a catalog item doesn't name one
    pub default_image: String,

    /// Readiness polling attempts
    pub readiness_max_attempts: u32,

    /// Delay between readiness polls in milliseconds
    pub readiness_interval_ms: u64,

    /// Pause between stop and start on restart in milliseconds
    pub restart_grace_ms: u64,

    /// Pod termination grace period in seconds
    pub termination_grace_period_seconds: i64,

    /// Service account for catalog items that opt in
    pub service_account_name: String,

    /// Hostname pods use to reach the developer machine
    pub host_alias: String,

    /// Delete orphan bare pods left behind by pre-Deployment versions
    pub legacy_pod_migration: bool,

    /// Container resource requests
    pub resource_requests: ResourceRequests,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            default_image: "ghcr.io/mcp-orchestrator/mcp-server-base:latest".to_string(),
            readiness_max_attempts: 60,
            readiness_interval_ms: 2000,
            restart_grace_ms: 1000,
            termination_grace_period_seconds: 5,
            service_account_name: "mcp-server".to_string(),
            host_alias: "host.docker.internal".to_string(),
            legacy_pod_migration: true,
            resource_requests: ResourceRequests::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequests {
    pub memory: String,
    pub cpu: String,
}

impl Default for ResourceRequests {
    fn default() -> Self {
        Self {
            memory: "128Mi".to_string(),
            cpu: "50m".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Write rolling log files here in addition to the console
    pub log_dir: Option<PathBuf>,

    /// Rotation of file output
    pub rotation: LogRotation,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            log_dir: None,
            rotation: LogRotation::Daily,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}
