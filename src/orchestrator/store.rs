//! External collaborators
//!
//! The orchestrator only reads installed servers and catalog items, and only
//! fetches secrets. Both are consumed through these traits.

use super::types::{CatalogItem, LogicalServer, SecretRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Read-only view of installed servers and the catalog
#[async_trait]
pub trait ServerRepository: Send + Sync {
    async fn find_all_installed_servers(&self) -> Result<Vec<LogicalServer>>;
    async fn find_server_by_id(&self, id: &str) -> Result<Option<LogicalServer>>;
    async fn find_catalog_item(&self, id: &str) -> Result<Option<CatalogItem>>;
}

/// Secrets manager lookups
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, id: &str) -> Result<Option<SecretRecord>>;
}

/// On-disk layout of a server manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerManifest {
    pub servers: Vec<LogicalServer>,
    pub catalog: Vec<CatalogItem>,
    pub secrets: HashMap<String, SecretRecord>,
}

/// Repository and secret store backed by an in-memory manifest
#[derive(Debug, Default)]
pub struct ManifestStore {
    manifest: RwLock<ServerManifest>,
}

impl ManifestStore {
    pub fn new(manifest: ServerManifest) -> Self {
        Self {
            manifest: RwLock::new(manifest),
        }
    }

    /// Load a YAML (or JSON) manifest file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let manifest: ServerManifest = serde_yaml_ng::from_str(&contents)?;
        tracing::info!(
            path = %path.display(),
            servers = manifest.servers.len(),
            catalog_items = manifest.catalog.len(),
            "Loaded server manifest"
        );
        Ok(Self::new(manifest))
    }

    /// Add or replace an installed server
    pub async fn upsert_server(&self, server: LogicalServer) {
        let mut manifest = self.manifest.write().await;
        manifest.servers.retain(|existing| existing.id != server.id);
        manifest.servers.push(server);
    }

    /// Add or replace a catalog item
    pub async fn upsert_catalog_item(&self, item: CatalogItem) {
        let mut manifest = self.manifest.write().await;
        manifest.catalog.retain(|existing| existing.id != item.id);
        manifest.catalog.push(item);
    }

    pub async fn insert_secret(&self, id: impl Into<String>, record: SecretRecord) {
        self.manifest.write().await.secrets.insert(id.into(), record);
    }

    pub async fn remove_server(&self, id: &str) -> bool {
        let mut manifest = self.manifest.write().await;
        let before = manifest.servers.len();
        manifest.servers.retain(|server| server.id != id);
        manifest.servers.len() != before
    }
}

#[async_trait]
impl ServerRepository for ManifestStore {
    async fn find_all_installed_servers(&self) -> Result<Vec<LogicalServer>> {
        Ok(self.manifest.read().await.servers.clone())
    }

    async fn find_server_by_id(&self, id: &str) -> Result<Option<LogicalServer>> {
        Ok(self
            .manifest
            .read()
            .await
            .servers
            .iter()
            .find(|server| server.id == id)
            .cloned())
    }

    async fn find_catalog_item(&self, id: &str) -> Result<Option<CatalogItem>> {
        Ok(self
            .manifest
            .read()
            .await
            .catalog
            .iter()
            .find(|item| item.id == id)
            .cloned())
    }
}

#[async_trait]
impl SecretStore for ManifestStore {
    async fn get_secret(&self, id: &str) -> Result<Option<SecretRecord>> {
        Ok(self.manifest.read().await.secrets.get(id).cloned())
    }
}

/// Secret store for deployments without a secrets manager
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecrets;

#[async_trait]
impl SecretStore for NoSecrets {
    async fn get_secret(&self, id: &str) -> Result<Option<SecretRecord>> {
        Err(Error::Store(format!(
            "secret {} requested but no secrets manager is configured",
            id
        )))
    }
}
