//! Per-server workload controller
//!
//! One [`McpServerDeployment`] owns the Deployment, Service and Secret of a
//! single logical MCP server and tracks its lifecycle state.

use super::cluster::{ClusterClient, LogOptions};
use super::environment::secret_values;
use super::naming;
use super::placement::PlacementCache;
use super::resources::{
    build_deployment, build_secret, build_service, pod_selector, selector_string, WorkloadSpec,
};
use super::types::{
    CatalogItem, DeploymentState, DeploymentStatusSummary, HttpSettings, LocalConfig,
    LogicalServer, CONTAINER_NAME,
};
use crate::config::RuntimeSettings;
use crate::error::{Error, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Container waiting reasons that never resolve without a spec change
pub const UNRECOVERABLE_REASONS: &[&str] = &[
    "ImagePullBackOff",
    "ErrImagePull",
    "CrashLoopBackOff",
    "CreateContainerConfigError",
    "CreateContainerError",
    "InvalidImageName",
];

/// Shared by every controller of one runtime manager
pub struct DeploymentContext {
    pub client: Arc<dyn ClusterClient>,
    pub namespace: String,
    pub in_cluster: bool,
    pub settings: RuntimeSettings,
    pub placement: Arc<PlacementCache>,
}

#[derive(Debug, Default)]
struct WorkloadStatus {
    state: DeploymentState,
    error_message: Option<String>,
    assigned_http_port: Option<u16>,
    http_endpoint_url: Option<String>,
}

enum Readiness {
    Ready,
    NotReady,
    Failed { reason: String, message: String },
}

/// Controller for the workload of one logical MCP server
pub struct McpServerDeployment {
    server: LogicalServer,
    catalog_item: Option<CatalogItem>,
    install_values: HashMap<String, String>,
    user_config_values: HashMap<String, String>,
    stored_secret_keys: BTreeSet<String>,
    deployment_name: String,
    secret_name: String,
    service_name: String,
    ctx: Arc<DeploymentContext>,
    status: RwLock<WorkloadStatus>,
}

impl std::fmt::Debug for McpServerDeployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServerDeployment")
            .field("server", &self.server)
            .field("deployment_name", &self.deployment_name)
            .field("secret_name", &self.secret_name)
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

impl McpServerDeployment {
    pub fn new(
        server: LogicalServer,
        catalog_item: Option<CatalogItem>,
        install_values: HashMap<String, String>,
        user_config_values: HashMap<String, String>,
        ctx: Arc<DeploymentContext>,
    ) -> Self {
        let deployment_name = naming::deployment_name(&server.name);
        let service_name = naming::service_name(&server.name);
        let secret_name = naming::secret_name(&server.id);

        Self {
            server,
            catalog_item,
            install_values,
            user_config_values,
            stored_secret_keys: BTreeSet::new(),
            deployment_name,
            secret_name,
            service_name,
            ctx,
            status: RwLock::new(WorkloadStatus::default()),
        }
    }

    /// Keys the secrets manager provisions into this server's secret.
    /// They are always referenced from the secret, never inlined.
    pub fn with_stored_secret_keys(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.stored_secret_keys = keys.into_iter().collect();
        self
    }

    pub fn server(&self) -> &LogicalServer {
        &self.server
    }

    pub fn deployment_name(&self) -> &str {
        &self.deployment_name
    }

    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Catalog config first, then the server's inline config
    pub fn local_config(&self) -> Option<&LocalConfig> {
        self.catalog_local_config()
            .or(self.server.local_config.as_ref())
    }

    fn catalog_local_config(&self) -> Option<&LocalConfig> {
        self.catalog_item
            .as_ref()
            .and_then(|item| item.local_config.as_ref())
    }

    pub fn http_settings(&self) -> Option<HttpSettings> {
        self.local_config().and_then(LocalConfig::http_settings)
    }

    pub fn uses_streamable_http(&self) -> bool {
        self.http_settings().is_some()
    }

    pub async fn state(&self) -> DeploymentState {
        self.status.read().await.state
    }

    pub async fn error_message(&self) -> Option<String> {
        self.status.read().await.error_message.clone()
    }

    pub async fn assigned_http_port(&self) -> Option<u16> {
        self.status.read().await.assigned_http_port
    }

    pub async fn http_endpoint_url(&self) -> Option<String> {
        self.status.read().await.http_endpoint_url.clone()
    }

    pub async fn status_summary(&self) -> DeploymentStatusSummary {
        let status = self.status.read().await;
        DeploymentStatusSummary {
            state: status.state,
            message: status.state.message().to_string(),
            error: status.error_message.clone(),
            deployment_name: self.deployment_name.clone(),
            secret_name: self.secret_name.clone(),
            namespace: self.ctx.namespace.clone(),
            assigned_http_port: status.assigned_http_port,
            http_endpoint_url: status.http_endpoint_url.clone(),
        }
    }

    async fn set_state(&self, state: DeploymentState) {
        let mut status = self.status.write().await;
        status.state = state;
        if state != DeploymentState::Failed {
            status.error_message = None;
        }
    }

    /// Record a failure that happened outside the controller's own calls
    pub async fn mark_failed(&self, message: impl Into<String>) {
        let mut status = self.status.write().await;
        status.state = DeploymentState::Failed;
        status.error_message = Some(message.into());
    }

    pub fn install_values(&self) -> &HashMap<String, String> {
        &self.install_values
    }

    pub fn user_config_values(&self) -> &HashMap<String, String> {
        &self.user_config_values
    }

    /// Secret contents: stored secrets plus secret-typed catalog values
    pub fn secret_data(&self, stored: BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut data = stored;
        if let Some(config) = self.catalog_local_config() {
            data.extend(secret_values(
                &config.environment,
                &self.install_values,
                &self.user_config_values,
            ));
        }
        data
    }

    /// Write the secret-backed values, replacing an existing Secret
    pub async fn create_k8s_secret(&self, data: &BTreeMap<String, String>) -> Result<()> {
        if data.is_empty() {
            debug!(secret = %self.secret_name, "No secret data, skipping Secret");
            return Ok(());
        }

        let secret = build_secret(&self.secret_name, &self.server, data);
        match self.ctx.client.create_secret(&secret).await {
            Ok(()) => {
                info!(secret = %self.secret_name, keys = data.len(), "Created Secret");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(secret = %self.secret_name, "Secret exists, replacing");
                self.ctx.client.replace_secret(&secret).await.map_err(|e| {
                    error!(secret = %self.secret_name, error = %e, "Failed to replace Secret");
                    Error::from(e)
                })?;
                info!(secret = %self.secret_name, "Replaced Secret");
                Ok(())
            }
            Err(e) => {
                error!(secret = %self.secret_name, error = %e, "Failed to create Secret");
                Err(e.into())
            }
        }
    }

    pub async fn delete_k8s_secret(&self) -> Result<()> {
        match self.ctx.client.delete_secret(&self.secret_name).await {
            Ok(()) => {
                info!(secret = %self.secret_name, "Deleted Secret");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(secret = %self.secret_name, "Secret already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_k8s_service(&self) -> Result<()> {
        match self.ctx.client.delete_service(&self.service_name).await {
            Ok(()) => {
                info!(service = %self.service_name, "Deleted Service");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(service = %self.service_name, "Service already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Adopt an existing Deployment or create a new one
    ///
    /// Any failure leaves the controller in `Failed` with the error message.
    pub async fn start_or_create_deployment(&self) -> Result<()> {
        match self.reconcile().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(deployment = %self.deployment_name, error = %e, "Failed to start deployment");
                self.mark_failed(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn reconcile(&self) -> Result<()> {
        if self.ctx.settings.legacy_pod_migration {
            self.migrate_legacy_pod().await;
        }

        match self.ctx.client.get_deployment(&self.deployment_name).await {
            Ok(existing) => return self.adopt(&existing).await,
            Err(e) if e.is_not_found() => {
                debug!(deployment = %self.deployment_name, "Deployment not found, creating");
            }
            Err(e) => return Err(e.into()),
        }

        self.create().await
    }

    async fn adopt(&self, existing: &Deployment) -> Result<()> {
        if available_replicas(existing) > 0 {
            info!(deployment = %self.deployment_name, "Adopting running deployment");
            self.set_state(DeploymentState::Running).await;
            match self.find_running_pod().await {
                Ok(Some(_)) => self.assign_http_port().await,
                Ok(None) => debug!(deployment = %self.deployment_name, "No running pod yet"),
                Err(e) => {
                    warn!(deployment = %self.deployment_name, error = %e, "Failed to list pods")
                }
            }
        } else {
            info!(deployment = %self.deployment_name, "Adopting deployment that is still starting");
            self.set_state(DeploymentState::Pending).await;
        }

        self.ensure_http_server_configured().await
    }

    async fn create(&self) -> Result<()> {
        let config = self
            .local_config()
            .ok_or_else(|| Error::MissingLocalConfig(self.server.name.clone()))?
            .normalized();
        let settings = &self.ctx.settings;
        let image = config
            .docker_image
            .clone()
            .filter(|image| !image.is_empty())
            .unwrap_or_else(|| settings.default_image.clone());
        let node_selector = self
            .ctx
            .placement
            .node_selector(self.ctx.client.as_ref())
            .await;

        let deployment = build_deployment(&WorkloadSpec {
            deployment_name: &self.deployment_name,
            secret_name: &self.secret_name,
            server: &self.server,
            image: &image,
            local_config: &config,
            catalog_defined: self.catalog_local_config().is_some(),
            install_values: &self.install_values,
            user_config_values: &self.user_config_values,
            stored_secret_keys: &self.stored_secret_keys,
            http_port: config.http_settings().map(|http| http.port),
            node_selector: node_selector.as_ref(),
            settings,
            host_alias: (!self.ctx.in_cluster).then_some(settings.host_alias.as_str()),
        });

        self.ctx.client.create_deployment(&deployment).await?;
        info!(deployment = %self.deployment_name, image = %image, "Created deployment");
        self.set_state(DeploymentState::Pending).await;

        self.ensure_http_server_configured().await
    }

    // 旧バージョンが作成した素のPodを削除（ReplicaSet管理下のPodは対象外）
    async fn migrate_legacy_pod(&self) {
        match self.ctx.client.get_pod(&self.deployment_name).await {
            Ok(pod) if !owned_by_replica_set(&pod) => {
                info!(pod = %self.deployment_name, "Deleting legacy bare pod");
                if let Err(e) = self.ctx.client.delete_pod(&self.deployment_name).await {
                    if !e.is_not_found() {
                        warn!(pod = %self.deployment_name, error = %e, "Failed to delete legacy pod");
                    }
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(pod = %self.deployment_name, error = %e, "Legacy pod check failed"),
        }
    }

    /// Poll until the workload has an available replica and a live pod
    pub async fn wait_for_deployment_ready(
        &self,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<()> {
        for attempt in 1..=max_attempts {
            match self.check_readiness().await {
                Ok(Readiness::Ready) => {
                    self.set_state(DeploymentState::Running).await;
                    self.assign_http_port().await;
                    info!(deployment = %self.deployment_name, attempt, "Deployment is ready");
                    return Ok(());
                }
                Ok(Readiness::Failed { reason, message }) => {
                    let err = Error::WorkloadFailed { reason, message };
                    error!(deployment = %self.deployment_name, error = %err, "Deployment failed");
                    self.mark_failed(err.to_string()).await;
                    return Err(err);
                }
                Ok(Readiness::NotReady) => {
                    debug!(deployment = %self.deployment_name, attempt, max_attempts, "Waiting for deployment");
                }
                // 一時的なエラーは次の試行で回復する可能性がある
                Err(e) => {
                    debug!(deployment = %self.deployment_name, attempt, error = %e, "Readiness check failed");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(Error::ReadinessTimeout {
            name: self.deployment_name.clone(),
            attempts: max_attempts,
        })
    }

    async fn check_readiness(&self) -> Result<Readiness> {
        let deployment = self.ctx.client.get_deployment(&self.deployment_name).await?;
        let pods = self.ctx.client.list_pods(&self.selector()).await?;

        if available_replicas(&deployment) > 0 && pods.iter().any(is_running) {
            return Ok(Readiness::Ready);
        }

        Ok(match unrecoverable_failure(&pods) {
            Some((reason, message)) => Readiness::Failed { reason, message },
            None => Readiness::NotReady,
        })
    }

    async fn assign_http_port(&self) {
        if let Some(http) = self.http_settings() {
            self.status.write().await.assigned_http_port = Some(http.port);
        }
    }

    /// Make sure a streamable-http server has a Service and an endpoint URL
    pub async fn ensure_http_server_configured(&self) -> Result<()> {
        let Some(http) = self.http_settings() else {
            return Ok(());
        };

        let client = &self.ctx.client;
        let service = match client.get_service(&self.service_name).await {
            Ok(service) => service,
            Err(e) if e.is_not_found() => {
                let service = build_service(
                    &self.service_name,
                    &self.server,
                    http.port,
                    !self.ctx.in_cluster,
                );
                match client.create_service(&service).await {
                    Ok(created) => {
                        info!(service = %self.service_name, port = http.port, "Created Service");
                        created
                    }
                    Err(e) if e.is_conflict() => client.get_service(&self.service_name).await?,
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let base_url = if self.ctx.in_cluster {
            Some(format!(
                "http://{}.{}.svc.cluster.local:{}",
                self.service_name, self.ctx.namespace, http.port
            ))
        } else {
            match node_port(&service) {
                Some(port) => Some(format!("http://localhost:{}", port)),
                None => {
                    warn!(service = %self.service_name, "Service has no node port yet, endpoint unknown");
                    None
                }
            }
        };

        if let Some(base_url) = base_url {
            let url = format!("{}{}", base_url, http.path);
            debug!(service = %self.service_name, url = %url, "HTTP endpoint configured");
            self.status.write().await.http_endpoint_url = Some(url);
        }

        Ok(())
    }

    /// Delete the Deployment; an already-missing one counts as stopped
    pub async fn stop_deployment(&self) -> Result<()> {
        match self.ctx.client.delete_deployment(&self.deployment_name).await {
            Ok(()) => info!(deployment = %self.deployment_name, "Deleted deployment"),
            Err(e) if e.is_not_found() => {
                debug!(deployment = %self.deployment_name, "Deployment already gone")
            }
            Err(e) => {
                error!(deployment = %self.deployment_name, error = %e, "Failed to delete deployment");
                return Err(e.into());
            }
        }

        let mut status = self.status.write().await;
        status.state = DeploymentState::NotCreated;
        status.error_message = None;
        status.assigned_http_port = None;
        Ok(())
    }

    /// Stop the workload and delete its Service and Secret
    pub async fn remove_deployment(&self) -> Result<()> {
        self.stop_deployment().await?;
        self.delete_k8s_service().await?;
        self.delete_k8s_secret().await?;
        self.status.write().await.http_endpoint_url = None;
        Ok(())
    }

    pub async fn get_recent_logs(&self, lines: i64) -> Result<String> {
        let Some(pod) = self.find_running_pod().await? else {
            return Ok(format!(
                "No running pod found for deployment {}",
                self.deployment_name
            ));
        };

        let pod_name = pod.metadata.name.unwrap_or_default();
        let logs = self
            .ctx
            .client
            .pod_logs(&pod_name, &LogOptions::tail(CONTAINER_NAME, lines))
            .await?;
        Ok(logs)
    }

    /// Follow the container log into `sink` until either side closes
    pub async fn stream_logs(&self, sink: mpsc::Sender<Result<String>>, lines: i64) -> Result<()> {
        let pod = self
            .find_running_pod()
            .await?
            .ok_or_else(|| Error::NoRunningPod(self.deployment_name.clone()))?;
        let pod_name = pod.metadata.name.unwrap_or_default();

        let mut stream = self
            .ctx
            .client
            .stream_pod_logs(&pod_name, &LogOptions::follow(CONTAINER_NAME, lines))
            .await?;
        debug!(pod = %pod_name, "Streaming logs");

        loop {
            tokio::select! {
                _ = sink.closed() => {
                    debug!(pod = %pod_name, "Log consumer went away");
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(line)) => {
                        if sink.send(Ok(line)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let message = e.to_string();
                        let _ = sink.send(Err(Error::LogStream(message.clone()))).await;
                        return Err(Error::LogStream(message));
                    }
                    None => break,
                }
            }
        }

        Ok(())
    }

    fn selector(&self) -> String {
        selector_string(&pod_selector(&self.server))
    }

    async fn find_running_pod(&self) -> Result<Option<Pod>> {
        let pods = self.ctx.client.list_pods(&self.selector()).await?;
        Ok(pods.into_iter().find(is_running))
    }
}

fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .unwrap_or(0)
}

fn is_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

fn owned_by_replica_set(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|owner| owner.kind == "ReplicaSet"))
}

fn node_port(service: &Service) -> Option<i32> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find_map(|port| port.node_port)
}

fn unrecoverable_failure(pods: &[Pod]) -> Option<(String, String)> {
    pods.iter()
        .filter_map(|pod| pod.status.as_ref())
        .flat_map(|status| {
            status
                .init_container_statuses
                .iter()
                .flatten()
                .chain(status.container_statuses.iter().flatten())
        })
        .filter_map(|container| container.state.as_ref()?.waiting.as_ref())
        .find_map(|waiting| {
            let reason = waiting.reason.as_deref()?;
            UNRECOVERABLE_REASONS.contains(&reason).then(|| {
                (
                    reason.to_string(),
                    waiting.message.clone().unwrap_or_else(|| reason.to_string()),
                )
            })
        })
}
