//! Cluster credential loading
//!
//! Credentials come from one of three sources, in priority order: the
//! in-cluster service account, an explicit kubeconfig file, or the ambient
//! default (`KUBECONFIG` / `~/.kube/config`). An explicit file is validated
//! before any connection is attempted.

use crate::config::KubernetesConfig;
use crate::error::{Error, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Where cluster credentials are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    InCluster,
    KubeconfigFile(PathBuf),
    Default,
}

impl CredentialSource {
    pub fn from_config(config: &KubernetesConfig) -> Self {
        if config.in_cluster {
            CredentialSource::InCluster
        } else if let Some(path) = &config.kubeconfig {
            CredentialSource::KubeconfigFile(path.clone())
        } else {
            CredentialSource::Default
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawKubeconfig {
    clusters: Option<Vec<RawNamedCluster>>,
    contexts: Option<Vec<serde_yaml_ng::Value>>,
    users: Option<Vec<serde_yaml_ng::Value>>,
}

#[derive(Debug, Deserialize)]
struct RawNamedCluster {
    name: Option<String>,
    cluster: Option<RawCluster>,
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    server: Option<String>,
}

/// Check that a kubeconfig file is usable before handing it to the client
pub fn validate_kubeconfig(path: &Path) -> Result<()> {
    let display = path.display();

    if !path.exists() {
        return Err(Error::Kubeconfig(format!(
            "Kubeconfig file not found at {}",
            display
        )));
    }

    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::Kubeconfig(format!("Failed to read kubeconfig {}: {}", display, e))
    })?;

    let raw: RawKubeconfig = serde_yaml_ng::from_str(&contents).map_err(|e| {
        Error::Kubeconfig(format!(
            "Kubeconfig {} is not a valid kubeconfig document: {}",
            display, e
        ))
    })?;

    let clusters = non_empty(raw.clusters, "clusters", path)?;
    non_empty(raw.contexts, "contexts", path)?;
    non_empty(raw.users, "users", path)?;

    let first = &clusters[0];
    if first.name.as_deref().map_or(true, str::is_empty) {
        return Err(Error::Kubeconfig(format!(
            "Kubeconfig {} has a cluster entry without a name",
            display
        )));
    }

    let server = first
        .cluster
        .as_ref()
        .and_then(|cluster| cluster.server.as_deref())
        .filter(|server| !server.is_empty())
        .ok_or_else(|| {
            Error::Kubeconfig(format!(
                "Kubeconfig {} has a cluster entry without a server URL",
                display
            ))
        })?;

    url::Url::parse(server).map_err(|e| {
        Error::Kubeconfig(format!(
            "Kubeconfig {} has an invalid server URL {:?}: {}",
            display, server, e
        ))
    })?;

    Ok(())
}

fn non_empty<T>(section: Option<Vec<T>>, name: &str, path: &Path) -> Result<Vec<T>> {
    match section {
        Some(entries) if !entries.is_empty() => Ok(entries),
        _ => Err(Error::Kubeconfig(format!(
            "Kubeconfig {} has no {} defined",
            path.display(),
            name
        ))),
    }
}

/// Load client configuration from the given source
pub async fn load_client_config(source: &CredentialSource) -> Result<kube::Config> {
    match source {
        CredentialSource::InCluster => {
            info!("Loading in-cluster Kubernetes credentials");
            kube::Config::incluster().map_err(|e| {
                Error::Kubeconfig(format!("Failed to load in-cluster credentials: {}", e))
            })
        }
        CredentialSource::KubeconfigFile(path) => {
            info!(path = %path.display(), "Loading kubeconfig file");
            validate_kubeconfig(path)?;
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::Kubeconfig(format!("Failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::Kubeconfig(format!(
                        "Failed to load kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })
        }
        CredentialSource::Default => {
            info!("Loading default Kubernetes credentials");
            kube::Config::infer().await.map_err(|e| {
                Error::Kubeconfig(format!("Failed to infer Kubernetes credentials: {}", e))
            })
        }
    }
}

/// Build a client from the given source
pub async fn connect(source: &CredentialSource) -> Result<kube::Client> {
    let config = load_client_config(source).await?;
    kube::Client::try_from(config)
        .map_err(|e| Error::Kubeconfig(format!("Failed to create Kubernetes client: {}", e)))
}
