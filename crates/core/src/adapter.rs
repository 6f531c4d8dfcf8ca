// The universal adapter: install, launch and bridge one stdio MCP server

use crate::bridge::JsonRpcBridge;
use crate::config::{AdapterSettings, Capabilities, ServerConfig};
use crate::error::{AdapterError, Result};
use crate::package::{npx_package_index, CommandRunner, PackageInstaller, PackageSpec, PackageType, ProcessRunner};
use crate::supervisor::ProcessSupervisor;
use chrono::{DateTime, Utc};
use mcpod_mcp::JsonRpcRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// What the HTTP façade needs from an adapter
#[async_trait::async_trait]
pub trait McpBackend: Send + Sync {
    /// Forward a request and return the child's response verbatim
    async fn forward_request(&self, request: &JsonRpcRequest) -> Result<Value>;

    /// Forward a notification without waiting for anything
    async fn forward_notification(&self, notification: &JsonRpcRequest) -> Result<()>;

    async fn health(&self) -> HealthReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// How the server is being run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSummary {
    pub executable: String,
    pub args: Vec<String>,
    #[serde(rename = "workingDir")]
    pub working_dir: PathBuf,
    pub package: PackageSpec,
}

/// Body of `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service: String,
    /// Seconds since the adapter finished initializing
    pub uptime: f64,
    pub process_running: bool,
    pub config: LaunchSummary,
    pub capabilities: HashMap<String, usize>,
    pub installed_packages: Vec<String>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

pub struct UniversalAdapter {
    name: String,
    package: PackageSpec,
    launch: ServerConfig,
    capabilities: Capabilities,
    installer: Arc<PackageInstaller>,
    bridge: JsonRpcBridge,
    started_at: Instant,
    shut_down: AtomicBool,
}

impl UniversalAdapter {
    /// Install the server's package, start it, and return a ready adapter.
    ///
    /// Any failure here is fatal: there is no degraded start.
    pub async fn initialize(settings: AdapterSettings) -> Result<Self> {
        Self::initialize_with(settings, Arc::new(ProcessRunner)).await
    }

    pub async fn initialize_with(settings: AdapterSettings, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let server = &settings.server;
        tracing::info!("Initializing adapter for {}", server.name);

        let package = PackageSpec::detect(&server.executable, &server.args);
        tracing::info!("Detected package {}", package.cache_key());

        let installer = Arc::new(PackageInstaller::with_runner(&settings.package_cache_dir, runner));
        installer.install(&package).await?;

        let launch = launch_config(server, &package, &installer, &settings.node_binary).await?;

        let supervisor = ProcessSupervisor::new(launch.clone(), settings.supervisor.clone(), installer.clone());
        let bridge = JsonRpcBridge::new(supervisor, settings.timeouts);
        bridge.start().await?;

        tracing::info!("Adapter for {} is ready", server.name);

        Ok(Self {
            name: server.name.clone(),
            package,
            launch,
            capabilities: settings.capabilities,
            installer,
            bridge,
            started_at: Instant::now(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn package(&self) -> &PackageSpec {
        &self.package
    }

    /// The command line actually launched, after any npx rewrite
    pub fn launch(&self) -> &ServerConfig {
        &self.launch
    }

    /// Stop the child and remove the package cache. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down adapter for {}", self.name);
        self.bridge.shutdown().await;
    }
}

#[async_trait::async_trait]
impl McpBackend for UniversalAdapter {
    async fn forward_request(&self, request: &JsonRpcRequest) -> Result<Value> {
        self.bridge.send_request(request).await
    }

    async fn forward_notification(&self, notification: &JsonRpcRequest) -> Result<()> {
        self.bridge.send_notification(notification).await
    }

    async fn health(&self) -> HealthReport {
        let status = self.bridge.status();

        HealthReport {
            status: if status.running {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            service: self.name.clone(),
            uptime: self.started_at.elapsed().as_secs_f64(),
            process_running: status.running,
            config: LaunchSummary {
                executable: self.launch.executable.clone(),
                args: self.launch.args.clone(),
                working_dir: self.launch.working_dir.clone(),
                package: self.package.clone(),
            },
            capabilities: self.capabilities.counts(),
            installed_packages: self.installer.installed_keys().await,
            restart_count: status.restart_count,
            last_restart: status.last_restart,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Run npx packages straight from their entry point.
///
/// `npx` spawns the package through its own nested child processes, which get
/// orphaned in minimal containers; invoking the interpreter on the installed
/// entry file avoids that. Anything else launches unchanged.
async fn launch_config(
    server: &ServerConfig,
    package: &PackageSpec,
    installer: &PackageInstaller,
    node_binary: &str,
) -> Result<ServerConfig> {
    if server.program_name() != "npx" || package.package_type != PackageType::Npm {
        return Ok(server.clone());
    }

    let entry = installer.resolve_entry_point(package).await?;
    let server_args_start = npx_package_index(&server.args)
        .map(|index| index + 1)
        .ok_or_else(|| AdapterError::EntryPoint {
            package: package.source.clone(),
            message: "npx arguments name no package".to_string(),
        })?;

    let mut args = vec![entry.to_string_lossy().into_owned()];
    args.extend(server.args[server_args_start..].iter().cloned());

    tracing::info!(
        "Running {} directly: {} {}",
        package.source,
        node_binary,
        entry.display()
    );

    Ok(ServerConfig {
        executable: node_binary.to_string(),
        args,
        ..server.clone()
    })
}
