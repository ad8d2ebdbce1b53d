//! MCP server runtime orchestration
//!
//! Runs every locally-hosted MCP server as a Kubernetes Deployment, with a
//! Service for streamable-http servers and a Secret for secret-backed
//! environment values.

pub mod cluster;
pub mod deployment;
pub mod environment;
pub mod kubeconfig;
pub mod manager;
pub mod naming;
pub mod placement;
pub mod resources;
pub mod store;
pub mod types;

pub use cluster::{ClusterClient, ClusterError, KubeClusterClient, LogOptions, LogStream};
pub use deployment::{DeploymentContext, McpServerDeployment};
pub use kubeconfig::{validate_kubeconfig, CredentialSource};
pub use manager::{McpRuntimeManager, RuntimeHooks};
pub use placement::{PlacementCache, PlacementState, PlatformIdentity};
pub use store::{ManifestStore, NoSecrets, SecretStore, ServerManifest, ServerRepository};
pub use types::*;
