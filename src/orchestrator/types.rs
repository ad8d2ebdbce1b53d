//! Orchestrator Types
//!
//! Data model shared by the workload controller and the runtime manager.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Port used by streamable-http servers that don't declare one
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Path used by streamable-http servers that don't declare one
pub const DEFAULT_HTTP_PATH: &str = "/mcp";

/// Name of the single container inside every managed workload
pub const CONTAINER_NAME: &str = "mcp-server";

/// Node selector copied from the platform pod onto managed workloads
pub type NodeSelector = BTreeMap<String, String>;

/// A tenant's installed MCP server, owned by the database layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalServer {
    pub id: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_id: Option<String>,

    /// Inline config for servers installed without catalog metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_config: Option<LocalConfig>,
}

impl LogicalServer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            catalog_id: None,
            secret_id: None,
            local_config: None,
        }
    }
}

/// Whether a catalog item runs as a managed workload or is reached remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    Local,
    Remote,
}

/// MCP transport spoken by the server process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    #[default]
    Stdio,
    StreamableHttp,
}

/// Kind of value an environment variable definition holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvVarType {
    #[default]
    PlainText,
    Secret,
}

/// One environment variable declared by a catalog item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvDefinition {
    pub key: String,

    #[serde(rename = "type", default)]
    pub type_: EnvVarType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default)]
    pub prompt_on_installation: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl EnvDefinition {
    pub fn is_secret(&self) -> bool {
        self.type_ == EnvVarType::Secret
    }
}

/// How to run a local server
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    /// Container image, falls back to the platform default image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,

    /// Entrypoint override, the image entrypoint is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments, may contain `${user_config.KEY}` placeholders
    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default)]
    pub environment: Vec<EnvDefinition>,

    #[serde(default)]
    pub transport_type: TransportMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_path: Option<String>,

    /// Opt in to running under the dedicated service account
    #[serde(default)]
    pub service_account: bool,
}

/// Resolved HTTP endpoint settings of a streamable-http server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub port: u16,
    pub path: String,
}

impl LocalConfig {
    /// The only place where HTTP port/path defaults are applied.
    ///
    /// Returns `None` for stdio servers.
    pub fn http_settings(&self) -> Option<HttpSettings> {
        if self.transport_type != TransportMode::StreamableHttp {
            return None;
        }

        let port = self
            .http_port
            .filter(|port| *port != 0)
            .unwrap_or(DEFAULT_HTTP_PORT);
        let path = match self.http_path.as_deref() {
            Some(path) if path.starts_with('/') => path.to_string(),
            Some(path) if !path.is_empty() => format!("/{}", path),
            _ => DEFAULT_HTTP_PATH.to_string(),
        };

        Some(HttpSettings { port, path })
    }

    /// Fill in `required`/`description` on every environment definition
    pub fn normalized(&self) -> Self {
        let mut normalized = self.clone();
        for definition in &mut normalized.environment {
            definition.required.get_or_insert(false);
            definition.description.get_or_insert_with(String::new);
        }
        normalized
    }
}

/// Reusable template describing how to run a class of servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub server_type: ServerType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_config: Option<LocalConfig>,
}

impl CatalogItem {
    pub fn is_local(&self) -> bool {
        self.server_type == ServerType::Local
    }
}

/// Opaque record held by the secrets manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub secret: HashMap<String, serde_json::Value>,
}

impl SecretRecord {
    /// Flatten values into strings; non-string values become JSON text
    pub fn to_string_map(&self) -> BTreeMap<String, String> {
        self.secret
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }
}

/// Lifecycle state of a single managed workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    #[default]
    NotCreated,
    Pending,
    Running,
    Failed,
}

impl DeploymentState {
    pub fn message(&self) -> &'static str {
        match self {
            DeploymentState::NotCreated => "Deployment not created",
            DeploymentState::Pending => "Deployment is starting",
            DeploymentState::Running => "Deployment is running",
            DeploymentState::Failed => "Deployment failed",
        }
    }
}

/// Process-wide lifecycle of the runtime manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    NotInitialized,
    Initializing,
    Running,
    Error,
    Stopped,
}

/// Per-server view reported to the API layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatusSummary {
    pub state: DeploymentState,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub deployment_name: String,
    pub secret_name: String,
    pub namespace: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_http_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_endpoint_url: Option<String>,
}

/// Streamable-http status of one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpointStatus {
    pub uses_streamable_http: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
}

/// Aggregate of the runtime and all registered servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatusSummary {
    pub status: RuntimeStatus,
    pub namespace: String,
    pub servers: BTreeMap<String, DeploymentStatusSummary>,
}

/// Outcome of the bulk startup fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}
