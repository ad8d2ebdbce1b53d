//! Kubernetes Resource Creation
//!
//! Deployment, Service and Secret construction for managed MCP servers

use super::environment::{interpolate_arguments, resolve_environment, EnvironmentInputs, ResolvedEnv};
use super::naming::sanitize_labels;
use super::types::{LocalConfig, LogicalServer, NodeSelector, CONTAINER_NAME};
use crate::config::RuntimeSettings;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, ResourceRequirements,
    Secret, SecretKeySelector, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Value of the `managed-by` label on every object we create
pub const MANAGED_BY: &str = "mcp-orchestrator";

const APP_LABEL: &str = "mcp-server";

/// Labels attached to the workload, its pods, service and secret
pub fn workload_labels(server: &LogicalServer) -> BTreeMap<String, String> {
    let mut labels = sanitize_labels([
        ("mcp-server-id", server.id.as_str()),
        ("mcp-server-name", server.name.as_str()),
    ]);
    labels.insert("app".to_string(), APP_LABEL.to_string());
    labels.insert("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string());
    labels
}

/// Labels that select the pods of one server
pub fn pod_selector(server: &LogicalServer) -> BTreeMap<String, String> {
    let mut selector = sanitize_labels([("mcp-server-id", server.id.as_str())]);
    selector.insert("app".to_string(), APP_LABEL.to_string());
    selector
}

/// Render a label map as a `k=v,k=v` selector string
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Everything needed to build the workload of one server
#[derive(Debug, Clone, Copy)]
pub struct WorkloadSpec<'a> {
    pub deployment_name: &'a str,
    pub secret_name: &'a str,
    pub server: &'a LogicalServer,
    pub image: &'a str,
    /// Normalized local config
    pub local_config: &'a LocalConfig,
    /// False when the server was installed without catalog metadata
    pub catalog_defined: bool,
    pub install_values: &'a HashMap<String, String>,
    pub user_config_values: &'a HashMap<String, String>,
    /// Keys provisioned from the secrets manager
    pub stored_secret_keys: &'a BTreeSet<String>,
    /// Container port, set only for streamable-http servers
    pub http_port: Option<u16>,
    pub node_selector: Option<&'a NodeSelector>,
    pub settings: &'a RuntimeSettings,
    /// Developer machine alias, set only when running outside the cluster
    pub host_alias: Option<&'a str>,
}

/// Create a Deployment for an MCP server
pub fn build_deployment(spec: &WorkloadSpec<'_>) -> Deployment {
    let labels = workload_labels(spec.server);
    let selector = pod_selector(spec.server);
    let config = spec.local_config;

    let environment = resolve_environment(EnvironmentInputs {
        definitions: spec
            .catalog_defined
            .then_some(config.environment.as_slice()),
        install_values: spec.install_values,
        user_config_values: spec.user_config_values,
        stored_secret_keys: spec.stored_secret_keys,
        secret_name: spec.secret_name,
        host_alias: spec.host_alias,
    });

    let args = interpolate_arguments(
        &config.arguments,
        spec.install_values,
        spec.user_config_values,
    );

    let mut requests = BTreeMap::new();
    requests.insert(
        "memory".to_string(),
        Quantity(spec.settings.resource_requests.memory.clone()),
    );
    requests.insert(
        "cpu".to_string(),
        Quantity(spec.settings.resource_requests.cpu.clone()),
    );

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.to_string()),
        command: config.command.clone().map(|command| vec![command]),
        args: (!args.is_empty()).then_some(args),
        env: (!environment.is_empty())
            .then(|| environment.iter().map(to_env_var).collect()),
        // stdio transport needs a persistent stdin
        stdin: Some(true),
        tty: Some(false),
        ports: spec.http_port.map(|port| {
            vec![ContainerPort {
                container_port: i32::from(port),
                protocol: Some("TCP".to_string()),
                name: Some("http".to_string()),
                ..Default::default()
            }]
        }),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        }),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        restart_policy: Some("Always".to_string()),
        termination_grace_period_seconds: Some(spec.settings.termination_grace_period_seconds),
        service_account_name: config
            .service_account
            .then(|| spec.settings.service_account_name.clone()),
        node_selector: spec
            .node_selector
            .filter(|selector| !selector.is_empty())
            .cloned(),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.deployment_name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create a Service for a streamable-http MCP server
///
/// `NodePort` exposes the server to a developer machine outside the cluster.
pub fn build_service(name: &str, server: &LogicalServer, port: u16, node_port: bool) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(workload_labels(server)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(pod_selector(server)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: i32::from(port),
                target_port: Some(IntOrString::Int(i32::from(port))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some(if node_port { "NodePort" } else { "ClusterIP" }.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create the Secret holding a server's secret-backed values
pub fn build_secret(name: &str, server: &LogicalServer, data: &BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(workload_labels(server)),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        // ByteString is base64-encoded on the wire
        data: Some(
            data.iter()
                .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn to_env_var(entry: &ResolvedEnv) -> EnvVar {
    match entry {
        ResolvedEnv::Literal { name, value } => EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        },
        ResolvedEnv::SecretRef {
            name,
            secret_name,
            key,
        } => EnvVar {
            name: name.clone(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret_name.clone(),
                    key: key.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}
