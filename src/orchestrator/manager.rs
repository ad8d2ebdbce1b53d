//! MCP Runtime Manager
//!
//! Process-wide owner of the cluster connection and the registry of
//! per-server workload controllers. Constructed once at boot and shut down
//! explicitly.

use super::cluster::{ClusterClient, KubeClusterClient};
use super::deployment::{DeploymentContext, McpServerDeployment};
use super::kubeconfig::{self, CredentialSource};
use super::placement::{PlacementCache, PlatformIdentity};
use super::store::{SecretStore, ServerRepository};
use super::types::{
    HttpEndpointStatus, LogicalServer, RuntimeStatus, RuntimeStatusSummary, StartupReport,
};
use crate::config::{KubernetesConfig, OrchestratorConfig, RuntimeSettings};
use crate::error::{Error, Result};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

type StartedHook = Box<dyn Fn(&StartupReport) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&Error) + Send + Sync>;

/// Callbacks fired at the end of [`McpRuntimeManager::start`]
#[derive(Default)]
pub struct RuntimeHooks {
    started: Option<StartedHook>,
    failed: Option<ErrorHook>,
}

impl RuntimeHooks {
    pub fn on_started(mut self, hook: impl Fn(&StartupReport) + Send + Sync + 'static) -> Self {
        self.started = Some(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.failed = Some(Box::new(hook));
        self
    }
}

/// Lifecycle manager for all managed MCP server workloads
pub struct McpRuntimeManager {
    namespace: String,
    ctx: Option<Arc<DeploymentContext>>,
    repository: Arc<dyn ServerRepository>,
    secrets: Arc<dyn SecretStore>,
    status: StdRwLock<RuntimeStatus>,
    deployments: RwLock<HashMap<String, Arc<McpServerDeployment>>>,
    hooks: RuntimeHooks,
}

impl McpRuntimeManager {
    /// Load credentials and build the manager
    ///
    /// Credential failures don't abort: the manager comes up in
    /// [`RuntimeStatus::Error`] without a cluster client.
    pub async fn connect(
        config: &OrchestratorConfig,
        repository: Arc<dyn ServerRepository>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let source = CredentialSource::from_config(&config.kubernetes);
        match kubeconfig::connect(&source).await {
            Ok(client) => {
                let cluster = KubeClusterClient::new(client, config.kubernetes.namespace.clone());
                Self::with_client(
                    Arc::new(cluster),
                    &config.kubernetes,
                    config.runtime.clone(),
                    repository,
                    secrets,
                )
            }
            Err(e) => {
                error!(error = %e, "Kubernetes runtime disabled");
                Self {
                    namespace: config.kubernetes.namespace.clone(),
                    ctx: None,
                    repository,
                    secrets,
                    status: StdRwLock::new(RuntimeStatus::Error),
                    deployments: RwLock::new(HashMap::new()),
                    hooks: RuntimeHooks::default(),
                }
            }
        }
    }

    /// Build the manager around an existing cluster client
    pub fn with_client(
        client: Arc<dyn ClusterClient>,
        kubernetes: &KubernetesConfig,
        settings: RuntimeSettings,
        repository: Arc<dyn ServerRepository>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let placement = PlacementCache::new(PlatformIdentity {
            pod_name: kubernetes.platform_pod_name(),
            label_selector: kubernetes.platform_pod_selector.clone(),
        });

        Self {
            namespace: kubernetes.namespace.clone(),
            ctx: Some(Arc::new(DeploymentContext {
                client,
                namespace: kubernetes.namespace.clone(),
                in_cluster: kubernetes.in_cluster,
                settings,
                placement: Arc::new(placement),
            })),
            repository,
            secrets,
            status: StdRwLock::new(RuntimeStatus::NotInitialized),
            deployments: RwLock::new(HashMap::new()),
            hooks: RuntimeHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: RuntimeHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.status.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: RuntimeStatus) {
        *self.status.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.status(), RuntimeStatus::Error | RuntimeStatus::Stopped)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Node selector cache, `None` when the runtime has no cluster client
    pub fn placement(&self) -> Option<&PlacementCache> {
        self.ctx.as_deref().map(|ctx| ctx.placement.as_ref())
    }

    fn context(&self) -> Result<Arc<DeploymentContext>> {
        self.ctx.clone().ok_or(Error::NotInitialized)
    }

    /// Verify the cluster and start every installed local server
    pub async fn start(&self) -> Result<StartupReport> {
        let result = self.start_all().await;
        match &result {
            Ok(report) => {
                if let Some(hook) = &self.hooks.started {
                    hook(report);
                }
            }
            Err(e) => {
                if let Some(hook) = &self.hooks.failed {
                    hook(e);
                }
            }
        }
        result
    }

    async fn start_all(&self) -> Result<StartupReport> {
        let ctx = self.context()?;

        info!(namespace = %self.namespace, "🚀 Starting MCP server runtime");
        self.set_status(RuntimeStatus::Initializing);

        if let Err(e) = ctx.client.verify_connectivity().await {
            error!(namespace = %self.namespace, error = %e, "Cluster connectivity check failed");
            self.set_status(RuntimeStatus::Error);
            return Err(e.into());
        }
        self.set_status(RuntimeStatus::Running);

        let servers = self.repository.find_all_installed_servers().await?;
        let mut local = Vec::new();
        for server in servers {
            if self.is_local(&server).await {
                local.push(server);
            }
        }

        let results = join_all(
            local
                .into_iter()
                .map(|server| self.start_server(server, None, None)),
        )
        .await;

        let failed = results.iter().filter(|result| result.is_err()).count();
        let report = StartupReport {
            total: results.len(),
            succeeded: results.len() - failed,
            failed,
        };

        if failed > 0 {
            warn!(total = report.total, failed, "⚠️ Some MCP servers failed to start");
        } else {
            info!(total = report.total, "✅ MCP servers started");
        }
        Ok(report)
    }

    // remoteサーバーはワークロード不要
    async fn is_local(&self, server: &LogicalServer) -> bool {
        let Some(catalog_id) = server.catalog_id.as_deref() else {
            return server.local_config.is_some();
        };

        match self.repository.find_catalog_item(catalog_id).await {
            Ok(Some(item)) => item.is_local(),
            Ok(None) => {
                warn!(server = %server.id, catalog = %catalog_id, "Catalog item not found, skipping");
                false
            }
            Err(e) => {
                warn!(server = %server.id, error = %e, "Catalog lookup failed, skipping");
                false
            }
        }
    }

    /// Register a controller for `server` and provision its workload
    ///
    /// The controller stays registered when provisioning fails so that the
    /// failure shows up in the status summary.
    pub async fn start_server(
        &self,
        server: LogicalServer,
        install_values: Option<HashMap<String, String>>,
        user_config_values: Option<HashMap<String, String>>,
    ) -> Result<Arc<McpServerDeployment>> {
        let ctx = self.context()?;

        let catalog_item = match server.catalog_id.as_deref() {
            Some(id) => self.repository.find_catalog_item(id).await?,
            None => None,
        };

        let (stored, secret_error) = match self.stored_secrets(&server).await {
            Ok(stored) => (stored, None),
            Err(e) => (BTreeMap::new(), Some(e)),
        };

        // 保存済みシークレットはインストール値としても参照させる
        let mut install_values = install_values.unwrap_or_default();
        for (key, value) in &stored {
            install_values
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        let controller = Arc::new(McpServerDeployment::new(
            server.clone(),
            catalog_item,
            install_values,
            user_config_values.unwrap_or_default(),
            ctx,
        )
        .with_stored_secret_keys(stored.keys().cloned()));
        self.deployments
            .write()
            .await
            .insert(server.id.clone(), controller.clone());

        let provisioned = match secret_error {
            Some(e) => Err(e),
            None => self.provision(&controller, stored).await,
        };

        match provisioned {
            Ok(()) => {
                info!(server = %server.id, deployment = %controller.deployment_name(), "MCP server started");
                Ok(controller)
            }
            Err(e) => {
                error!(server = %server.id, error = %e, "Failed to start MCP server");
                controller.mark_failed(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        controller: &McpServerDeployment,
        stored: BTreeMap<String, String>,
    ) -> Result<()> {
        controller
            .create_k8s_secret(&controller.secret_data(stored))
            .await?;
        controller.start_or_create_deployment().await
    }

    async fn stored_secrets(&self, server: &LogicalServer) -> Result<BTreeMap<String, String>> {
        let Some(secret_id) = server.secret_id.as_deref() else {
            return Ok(BTreeMap::new());
        };

        match self.secrets.get_secret(secret_id).await? {
            Some(record) => Ok(record.to_string_map()),
            None => {
                warn!(server = %server.id, secret = %secret_id, "Referenced secret not found");
                Ok(BTreeMap::new())
            }
        }
    }

    /// Tear down a server's workload and unregister it
    pub async fn stop_server(&self, id: &str) -> Result<()> {
        let Some(controller) = self.get_deployment(id).await else {
            debug!(server = %id, "Server not registered, nothing to stop");
            return Ok(());
        };

        controller.remove_deployment().await?;
        self.deployments.write().await.remove(id);
        info!(server = %id, "MCP server stopped");
        Ok(())
    }

    /// Stop and start a server again, re-reading it from the repository
    pub async fn restart_server(&self, id: &str) -> Result<Arc<McpServerDeployment>> {
        let server = self
            .repository
            .find_server_by_id(id)
            .await?
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))?;

        let previous = self.get_deployment(id).await.map(|controller| {
            (
                controller.install_values().clone(),
                controller.user_config_values().clone(),
            )
        });

        info!(server = %id, "🔄 Restarting MCP server");
        self.stop_server(id).await?;

        let grace = self.context()?.settings.restart_grace_ms;
        tokio::time::sleep(Duration::from_millis(grace)).await;

        let (install_values, user_config_values) = previous.unzip();
        self.start_server(server, install_values, user_config_values)
            .await
    }

    /// Remove a server for good; it is unregistered even if teardown fails
    pub async fn remove_mcp_server(&self, id: &str) -> Result<()> {
        let Some(controller) = self.get_deployment(id).await else {
            warn!(server = %id, "Server not registered, nothing to remove");
            return Ok(());
        };

        let result = controller.remove_deployment().await;
        self.deployments.write().await.remove(id);

        match &result {
            Ok(()) => info!(server = %id, "MCP server removed"),
            Err(e) => error!(server = %id, error = %e, "Failed to remove MCP server resources"),
        }
        result
    }

    /// Stop every registered server; individual failures are only logged
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down MCP server runtime");
        self.set_status(RuntimeStatus::Stopped);

        let ids: Vec<String> = self.deployments.read().await.keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| self.stop_server(id))).await;

        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(server = %id, error = %e, "Failed to stop MCP server during shutdown");
            }
        }
    }

    pub async fn get_deployment(&self, id: &str) -> Option<Arc<McpServerDeployment>> {
        self.deployments.read().await.get(id).cloned()
    }

    pub async fn status_summary(&self) -> RuntimeStatusSummary {
        let controllers: Vec<_> = self
            .deployments
            .read()
            .await
            .iter()
            .map(|(id, controller)| (id.clone(), controller.clone()))
            .collect();

        let mut servers = BTreeMap::new();
        for (id, controller) in controllers {
            servers.insert(id, controller.status_summary().await);
        }

        RuntimeStatusSummary {
            status: self.status(),
            namespace: self.namespace.clone(),
            servers,
        }
    }

    /// Streamable-http status of a registered server
    pub async fn http_status(&self, id: &str) -> Option<HttpEndpointStatus> {
        let controller = self.get_deployment(id).await?;
        Some(HttpEndpointStatus {
            uses_streamable_http: controller.uses_streamable_http(),
            endpoint_url: controller.http_endpoint_url().await,
        })
    }

    pub async fn get_recent_logs(&self, id: &str, lines: i64) -> Result<String> {
        let controller = self
            .get_deployment(id)
            .await
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))?;
        controller.get_recent_logs(lines).await
    }

    pub async fn stream_logs(
        &self,
        id: &str,
        sink: mpsc::Sender<Result<String>>,
        lines: i64,
    ) -> Result<()> {
        let controller = self
            .get_deployment(id)
            .await
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))?;
        controller.stream_logs(sink, lines).await
    }
}
