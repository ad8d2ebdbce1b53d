//! In-memory cluster used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateWaiting, ContainerStatus, Pod, PodSpec, PodStatus, Secret,
    Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use mcp_orchestrator::config::{KubernetesConfig, RuntimeSettings};
use mcp_orchestrator::orchestrator::{
    CatalogItem, ClusterClient, ClusterError, EnvDefinition, EnvVarType, LocalConfig, LogOptions,
    LogStream, LogicalServer, ManifestStore, McpRuntimeManager, ServerManifest, ServerType,
    TransportMode,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "tenants";
pub const PLATFORM_POD: &str = "platform-0";

#[derive(Default)]
pub struct FakeState {
    pub pods: BTreeMap<String, Pod>,
    pub deployments: BTreeMap<String, Deployment>,
    pub services: BTreeMap<String, Service>,
    pub secrets: BTreeMap<String, Secret>,
    pub calls: Vec<String>,
    pub unreachable: bool,
    pub failures: HashMap<String, ClusterError>,
    pub logs: Vec<String>,
    next_node_port: i32,
}

/// Namespaced object store with just enough behavior for the controller
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Fail the next call of `operation`
    pub fn fail_next(&self, operation: &str, error: ClusterError) {
        self.state().failures.insert(operation.to_string(), error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn calls_of(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(&format!("{}:", operation)))
            .collect()
    }

    pub fn add_pod(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap();
        self.state().pods.insert(name, pod);
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.state().deployments.get(name).cloned()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.state().services.get(name).cloned()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.state().secrets.get(name).cloned()
    }

    /// Pretend the scheduler started the deployment's pod
    pub fn mark_ready(&self, deployment: &str) {
        let labels = self.template_labels(deployment);
        let mut state = self.state();
        if let Some(existing) = state.deployments.get_mut(deployment) {
            existing.status = Some(DeploymentStatus {
                available_replicas: Some(1),
                ..Default::default()
            });
        }
        state.pods.insert(
            format!("{}-7d9f8", deployment),
            workload_pod(deployment, labels, "Running", None),
        );
    }

    /// Pretend the deployment's pod is stuck on `reason`
    pub fn fail_pods(&self, deployment: &str, reason: &str) {
        let labels = self.template_labels(deployment);
        self.state().pods.insert(
            format!("{}-7d9f8", deployment),
            workload_pod(deployment, labels, "Pending", Some(reason)),
        );
    }

    fn template_labels(&self, deployment: &str) -> BTreeMap<String, String> {
        self.state()
            .deployments
            .get(deployment)
            .and_then(|d| d.spec.as_ref())
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|meta| meta.labels.clone())
            .unwrap_or_default()
    }

    fn record(&self, operation: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.calls.push(format!("{}:{}", operation, name));
        match state.failures.remove(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn object_name(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

fn not_found(kind: &str, name: &str) -> ClusterError {
    ClusterError::NotFound(format!("{} {} not found", kind, name))
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let labels = match labels {
        Some(labels) => labels,
        None => return selector.is_empty(),
    };
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => false,
        })
}

pub fn workload_pod(
    deployment: &str,
    labels: BTreeMap<String, String>,
    phase: &str,
    waiting_reason: Option<&str>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-7d9f8", deployment)),
            labels: Some(labels),
            owner_references: Some(vec![OwnerReference {
                kind: "ReplicaSet".to_string(),
                name: format!("{}-7d9f8", deployment),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            container_statuses: waiting_reason.map(|reason| {
                vec![ContainerStatus {
                    name: "mcp-server".to_string(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some(reason.to_string()),
                            message: Some(format!("{} for image example/broken:1", reason)),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
    }
}

/// Platform pod carrying the scheduling constraints workloads inherit
pub fn platform_pod(node_selector: Option<BTreeMap<String, String>>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(PLATFORM_POD.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/name".to_string(),
                "mcp-platform".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_selector,
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn verify_connectivity(&self) -> Result<(), ClusterError> {
        self.record("verify_connectivity", NAMESPACE)?;
        if self.state().unreachable {
            return Err(ClusterError::Other("connection refused".to_string()));
        }
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, ClusterError> {
        self.record("get_pod", name)?;
        self.state()
            .pods
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("pod", name))
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ClusterError> {
        self.record("list_pods", label_selector)?;
        Ok(self
            .state()
            .pods
            .values()
            .filter(|pod| matches_selector(pod.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        self.record("delete_pod", name)?;
        self.state()
            .pods
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("pod", name))
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError> {
        self.record("get_deployment", name)?;
        self.state()
            .deployments
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("deployment", name))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        let name = object_name(&deployment.metadata);
        self.record("create_deployment", &name)?;
        let mut state = self.state();
        if state.deployments.contains_key(&name) {
            return Err(ClusterError::Conflict(format!("deployment {} exists", name)));
        }
        state.deployments.insert(name, deployment.clone());
        Ok(deployment.clone())
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), ClusterError> {
        self.record("delete_deployment", name)?;
        let mut state = self.state();
        let removed = state
            .deployments
            .remove(name)
            .ok_or_else(|| not_found("deployment", name))?;

        let selector = removed
            .spec
            .and_then(|spec| spec.selector.match_labels)
            .unwrap_or_default();
        state.pods.retain(|_, pod| {
            let labels = pod.metadata.labels.clone().unwrap_or_default();
            !selector.iter().all(|(k, v)| labels.get(k) == Some(v))
        });
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Service, ClusterError> {
        self.record("get_service", name)?;
        self.state()
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("service", name))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ClusterError> {
        let name = object_name(&service.metadata);
        self.record("create_service", &name)?;
        let mut state = self.state();
        if state.services.contains_key(&name) {
            return Err(ClusterError::Conflict(format!("service {} exists", name)));
        }

        let mut created = service.clone();
        let node_port = 30000 + state.next_node_port;
        if let Some(spec) = created.spec.as_mut() {
            if spec.type_.as_deref() == Some("NodePort") {
                for port in spec.ports.iter_mut().flatten() {
                    port.node_port = Some(node_port);
                }
                state.next_node_port += 1;
            }
        }
        state.services.insert(name, created.clone());
        Ok(created)
    }

    async fn delete_service(&self, name: &str) -> Result<(), ClusterError> {
        self.record("delete_service", name)?;
        self.state()
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("service", name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let name = object_name(&secret.metadata);
        self.record("create_secret", &name)?;
        let mut state = self.state();
        if state.secrets.contains_key(&name) {
            return Err(ClusterError::Conflict(format!("secret {} exists", name)));
        }
        state.secrets.insert(name, secret.clone());
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let name = object_name(&secret.metadata);
        self.record("replace_secret", &name)?;
        let mut state = self.state();
        if !state.secrets.contains_key(&name) {
            return Err(not_found("secret", &name));
        }
        state.secrets.insert(name, secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ClusterError> {
        self.record("delete_secret", name)?;
        self.state()
            .secrets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("secret", name))
    }

    async fn pod_logs(&self, pod: &str, options: &LogOptions) -> Result<String, ClusterError> {
        self.record("pod_logs", pod)?;
        let logs = self.state().logs.clone();
        let tail = options.tail_lines.unwrap_or(logs.len() as i64).max(0) as usize;
        let skip = logs.len().saturating_sub(tail);
        Ok(logs[skip..].join("\n"))
    }

    async fn stream_pod_logs(
        &self,
        pod: &str,
        _options: &LogOptions,
    ) -> Result<LogStream, ClusterError> {
        self.record("stream_pod_logs", pod)?;
        let lines: Vec<Result<String, ClusterError>> =
            self.state().logs.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(lines).boxed())
    }
}

pub fn server(id: &str, name: &str, catalog_id: Option<&str>) -> LogicalServer {
    let mut server = LogicalServer::new(id, name);
    server.catalog_id = catalog_id.map(String::from);
    server
}

pub fn stdio_catalog(id: &str) -> CatalogItem {
    CatalogItem {
        id: id.to_string(),
        name: Some("Filesystem".to_string()),
        server_type: ServerType::Local,
        local_config: Some(LocalConfig {
            docker_image: Some("example/mcp-filesystem:1".to_string()),
            command: Some("npx".to_string()),
            arguments: vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-filesystem".to_string(),
                "${user_config.root}".to_string(),
            ],
            ..Default::default()
        }),
    }
}

pub fn http_catalog(id: &str, port: u16, path: &str) -> CatalogItem {
    CatalogItem {
        id: id.to_string(),
        name: Some("Weather".to_string()),
        server_type: ServerType::Local,
        local_config: Some(LocalConfig {
            docker_image: Some("example/mcp-weather:1".to_string()),
            transport_type: TransportMode::StreamableHttp,
            http_port: Some(port),
            http_path: Some(path.to_string()),
            ..Default::default()
        }),
    }
}

pub fn secret_catalog(id: &str) -> CatalogItem {
    let mut item = stdio_catalog(id);
    if let Some(config) = item.local_config.as_mut() {
        config.environment = vec![
            EnvDefinition {
                key: "API_KEY".to_string(),
                type_: EnvVarType::Secret,
                value: None,
                prompt_on_installation: true,
                required: Some(true),
                description: Some("API key".to_string()),
            },
            EnvDefinition {
                key: "REGION".to_string(),
                type_: EnvVarType::PlainText,
                value: Some("'eu-west-1'".to_string()),
                prompt_on_installation: false,
                required: None,
                description: None,
            },
        ];
    }
    item
}

pub fn remote_catalog(id: &str) -> CatalogItem {
    CatalogItem {
        id: id.to_string(),
        name: Some("Remote".to_string()),
        server_type: ServerType::Remote,
        local_config: None,
    }
}

pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub store: Arc<ManifestStore>,
    pub manager: McpRuntimeManager,
}

pub fn fast_settings() -> RuntimeSettings {
    RuntimeSettings {
        readiness_interval_ms: 5,
        restart_grace_ms: 0,
        ..Default::default()
    }
}

pub fn harness(in_cluster: bool, manifest: ServerManifest) -> Harness {
    let cluster = FakeCluster::new();
    let store = Arc::new(ManifestStore::new(manifest));
    let kubernetes = KubernetesConfig {
        namespace: NAMESPACE.to_string(),
        in_cluster,
        pod_name: Some(PLATFORM_POD.to_string()),
        ..Default::default()
    };

    let manager = McpRuntimeManager::with_client(
        cluster.clone(),
        &kubernetes,
        fast_settings(),
        store.clone(),
        store.clone(),
    );

    Harness {
        cluster,
        store,
        manager,
    }
}
