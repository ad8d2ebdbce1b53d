//! Cluster Client Adapter
//!
//! Thin namespaced wrapper around the Kubernetes API. Callers branch on
//! [`ClusterError`] variants instead of inspecting raw status codes.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::{Api, Client};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

const LOG_STREAM_BUFFER: usize = 64;

/// Errors surfaced by the cluster API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// HTTP 404
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP 409
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message),
            other => ClusterError::Other(other.to_string()),
        }
    }
}

/// Line-oriented pod log stream. Dropping it closes the upstream request.
pub type LogStream = BoxStream<'static, Result<String, ClusterError>>;

/// Options for reading container logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub container: String,
    pub follow: bool,
    pub tail_lines: Option<i64>,
    pub pretty: bool,
    pub timestamps: bool,
}

impl LogOptions {
    pub fn tail(container: &str, lines: i64) -> Self {
        Self {
            container: container.to_string(),
            follow: false,
            tail_lines: Some(lines),
            pretty: false,
            timestamps: true,
        }
    }

    pub fn follow(container: &str, lines: i64) -> Self {
        Self {
            follow: true,
            ..Self::tail(container, lines)
        }
    }
}

/// Namespaced cluster operations the orchestrator depends on
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real [`KubeClusterClient`] in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Lightweight list call proving the namespace is reachable
    async fn verify_connectivity(&self) -> Result<(), ClusterError>;

    async fn get_pod(&self, name: &str) -> Result<Pod, ClusterError>;
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ClusterError>;
    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError>;
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError>;
    async fn delete_deployment(&self, name: &str) -> Result<(), ClusterError>;

    async fn get_service(&self, name: &str) -> Result<Service, ClusterError>;
    async fn create_service(&self, service: &Service) -> Result<Service, ClusterError>;
    async fn delete_service(&self, name: &str) -> Result<(), ClusterError>;

    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError>;
    async fn replace_secret(&self, secret: &Secret) -> Result<(), ClusterError>;
    async fn delete_secret(&self, name: &str) -> Result<(), ClusterError>;

    async fn pod_logs(&self, pod: &str, options: &LogOptions) -> Result<String, ClusterError>;
    async fn stream_pod_logs(
        &self,
        pod: &str,
        options: &LogOptions,
    ) -> Result<LogStream, ClusterError>;
}

/// [`ClusterClient`] backed by a `kube` client bound to one namespace
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl KubeClusterClient {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Raw client, e.g. for exec/attach sessions
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn log_params(options: &LogOptions) -> LogParams {
        LogParams {
            container: Some(options.container.clone()),
            follow: options.follow,
            tail_lines: options.tail_lines,
            pretty: options.pretty,
            timestamps: options.timestamps,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn verify_connectivity(&self) -> Result<(), ClusterError> {
        self.api::<Pod>()
            .list(&ListParams::default().limit(1))
            .await?;
        debug!(namespace = %self.namespace, "cluster connectivity verified");
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> Result<Pod, ClusterError> {
        Ok(self.api::<Pod>().get(name).await?)
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let pods = self
            .api::<Pod>()
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        self.api::<Pod>()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError> {
        Ok(self.api::<Deployment>().get(name).await?)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        Ok(self
            .api::<Deployment>()
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), ClusterError> {
        self.api::<Deployment>()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Service, ClusterError> {
        Ok(self.api::<Service>().get(name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ClusterError> {
        Ok(self
            .api::<Service>()
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn delete_service(&self, name: &str) -> Result<(), ClusterError> {
        self.api::<Service>()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        self.api::<Secret>()
            .create(&PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::Other("secret has no name".to_string()))?;
        self.api::<Secret>()
            .replace(name, &PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ClusterError> {
        self.api::<Secret>()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn pod_logs(&self, pod: &str, options: &LogOptions) -> Result<String, ClusterError> {
        Ok(self
            .api::<Pod>()
            .logs(pod, &Self::log_params(options))
            .await?)
    }

    async fn stream_pod_logs(
        &self,
        pod: &str,
        options: &LogOptions,
    ) -> Result<LogStream, ClusterError> {
        let api = self.api::<Pod>();
        let pod = pod.to_string();
        let params = Self::log_params(options);
        let (tx, rx) = mpsc::channel(LOG_STREAM_BUFFER);
        let (opened_tx, opened_rx) = oneshot::channel();

        // The reader lives in its own task and ends once the receiver is dropped.
        tokio::spawn(async move {
            let reader = match api.log_stream(&pod, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(ClusterError::from(e)));
                    return;
                }
            };

            let mut lines = Box::pin(reader.lines());
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    line = lines.next() => match line {
                        Some(line) => {
                            let item = line.map_err(|e| ClusterError::Other(e.to_string()));
                            if tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(pod = %pod, "log stream closed");
        });

        opened_rx
            .await
            .map_err(|_| ClusterError::Other("log stream task ended early".to_string()))??;

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}
