//! # mcp-orchestrator
//!
//! Kubernetes workload lifecycle controller for per-tenant MCP servers.
//!
//! Each installed MCP server becomes a Deployment (plus a Service for
//! streamable-http transports and a Secret for secret-backed values) that the
//! [`McpRuntimeManager`] creates, adopts, watches and tears down.

pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;

pub use error::{Error, Result};
pub use orchestrator::{McpRuntimeManager, McpServerDeployment};
