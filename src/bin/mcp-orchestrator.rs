//! MCP Orchestrator - per-tenant MCP server workloads on Kubernetes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tracing::{error, info, warn};

use mcp_orchestrator::config::{ConfigLoader, LogFormat, OrchestratorConfig};
use mcp_orchestrator::orchestrator::{
    validate_kubeconfig, ManifestStore, McpRuntimeManager, RuntimeHooks,
};

/// Run locally-hosted MCP servers as Kubernetes workloads
#[derive(Parser, Debug)]
#[command(name = "mcp-orchestrator", version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, env = "MCP_ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Manifest with installed servers, catalog items and secrets
    #[arg(short, long, env = "MCP_ORCHESTRATOR_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Namespace for managed workloads
    #[arg(short, long)]
    namespace: Option<String>,

    /// Kubeconfig file used outside the cluster
    #[arg(long, env = "KUBECONFIG_PATH")]
    kubeconfig: Option<PathBuf>,

    /// Use in-cluster service account credentials
    #[arg(long)]
    in_cluster: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start every installed local server and keep running until Ctrl-C
    Run {
        /// Wait for each workload to become ready after starting it
        #[arg(long)]
        wait: bool,
    },

    /// Start every installed local server and print the status summary as JSON
    Status,

    /// Check a kubeconfig file without connecting
    ValidateKubeconfig {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::ValidateKubeconfig { path }) = &cli.command {
        validate_kubeconfig(path)?;
        println!("✅ {} is a valid kubeconfig", path.display());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let _guard = mcp_orchestrator::logging::init(&config.logging)?;

    let store = Arc::new(match &config.manifest_path {
        Some(path) => ManifestStore::from_file(path)
            .with_context(|| format!("Failed to load manifest {}", path.display()))?,
        None => {
            warn!("No manifest configured, starting with an empty server list");
            ManifestStore::default()
        }
    });

    let hooks = RuntimeHooks::default()
        .on_started(|report| {
            info!(
                total = report.total,
                succeeded = report.succeeded,
                failed = report.failed,
                "Runtime started"
            )
        })
        .on_error(|e| error!(error = %e, "Runtime failed to start"));

    let manager = McpRuntimeManager::connect(&config, store.clone(), store)
        .await
        .with_hooks(hooks);

    if !manager.is_enabled() {
        anyhow::bail!("Kubernetes runtime is disabled, check the cluster credentials");
    }

    match cli.command {
        Some(Commands::Status) => {
            manager.start().await?;
            let summary = manager.status_summary().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Some(Commands::Run { wait }) => run(&manager, &config, wait).await,
        None => run(&manager, &config, false).await,
        Some(Commands::ValidateKubeconfig { .. }) => Ok(()),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<OrchestratorConfig> {
    let mut config = ConfigLoader::new()
        .load_from_file(cli.config.clone())
        .load_from_env()
        .build()?;

    // コマンドライン引数が最優先
    if let Some(manifest) = &cli.manifest {
        config.manifest_path = Some(manifest.clone());
    }
    if let Some(namespace) = &cli.namespace {
        config.kubernetes.namespace = namespace.clone();
    }
    if let Some(kubeconfig) = &cli.kubeconfig {
        config.kubernetes.kubeconfig = Some(kubeconfig.clone());
    }
    if cli.in_cluster {
        config.kubernetes.in_cluster = true;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }

    Ok(config)
}

async fn run(
    manager: &McpRuntimeManager,
    config: &OrchestratorConfig,
    wait: bool,
) -> anyhow::Result<()> {
    manager.start().await?;

    if wait {
        let summary = manager.status_summary().await;
        let mut controllers = Vec::new();
        for id in summary.servers.keys() {
            if let Some(controller) = manager.get_deployment(id).await {
                controllers.push(controller);
            }
        }

        let attempts = config.runtime.readiness_max_attempts;
        let interval = Duration::from_millis(config.runtime.readiness_interval_ms);
        let results = join_all(
            controllers
                .iter()
                .map(|controller| controller.wait_for_deployment_ready(attempts, interval)),
        )
        .await;

        for (controller, result) in controllers.iter().zip(results) {
            if let Err(e) = result {
                warn!(deployment = %controller.deployment_name(), error = %e, "Workload not ready");
            }
        }
    }

    info!(namespace = %manager.namespace(), "Running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    manager.shutdown().await;
    Ok(())
}
