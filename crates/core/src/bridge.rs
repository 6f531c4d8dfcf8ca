// Line-delimited JSON-RPC over the child's stdio, one exchange at a time

use crate::error::{AdapterError, Result};
use crate::supervisor::ProcessSupervisor;
use chrono::{DateTime, Utc};
use mcpod_mcp::JsonRpcRequest;
use serde_json::Value;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// How long to wait for the child's response line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeTimeouts {
    pub request: Duration,
    /// `initialize` may trigger package resolution inside the child
    pub initialize: Duration,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            initialize: Duration::from_secs(60),
        }
    }
}

impl BridgeTimeouts {
    pub fn for_method(&self, method: &str) -> Duration {
        if method == "initialize" {
            self.initialize
        } else {
            self.request
        }
    }
}

/// Point-in-time view of the supervised child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_restart: Option<DateTime<Utc>>,
}

impl SupervisorStatus {
    fn observe(supervisor: &mut ProcessSupervisor) -> Self {
        Self {
            running: supervisor.is_healthy(),
            pid: supervisor.child_id(),
            restart_count: supervisor.restart_count(),
            last_restart: supervisor.last_restart(),
        }
    }
}

/// Serializes JSON-RPC traffic onto the single child process.
///
/// The supervisor lives behind one async mutex; every exchange holds it from
/// the liveness check until the response line is read, so concurrent callers
/// never interleave bytes on the pipes.
pub struct JsonRpcBridge {
    supervisor: Mutex<ProcessSupervisor>,
    timeouts: BridgeTimeouts,
    // last status observed while holding the lock, served while a request is in flight
    status: StdMutex<SupervisorStatus>,
}

impl JsonRpcBridge {
    pub fn new(supervisor: ProcessSupervisor, timeouts: BridgeTimeouts) -> Self {
        Self {
            supervisor: Mutex::new(supervisor),
            timeouts,
            status: StdMutex::new(SupervisorStatus::default()),
        }
    }

    /// Start the child for the first time
    pub async fn start(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        let result = supervisor.start().await;
        self.record(&mut supervisor);
        result
    }

    /// Send a request and return the child's response line, parsed
    pub async fn send_request(&self, request: &JsonRpcRequest) -> Result<Value> {
        let line = serde_json::to_string(request)?;
        let timeout = self.timeouts.for_method(&request.method);

        let mut supervisor = self.supervisor.lock().await;
        tracing::debug!("-> {} (id {:?})", request.method, request.id);

        let result = Self::exchange(&mut supervisor, &line, request.id.as_ref(), timeout).await;
        self.record(&mut supervisor);

        match &result {
            Ok(_) => tracing::debug!("<- {} (id {:?})", request.method, request.id),
            Err(e) => tracing::warn!("{} failed: {}", request.method, e),
        }
        result
    }

    /// Write a notification; nothing is read back
    pub async fn send_notification(&self, notification: &JsonRpcRequest) -> Result<()> {
        let line = serde_json::to_string(notification)?;

        let mut supervisor = self.supervisor.lock().await;
        tracing::debug!("-> {} (notification)", notification.method);

        let result = match Self::ensure_running(&mut supervisor).await {
            Ok(()) => match supervisor.handle_mut() {
                Some(handle) => handle.write_line(&line).await,
                None => Err(AdapterError::NotRunning),
            },
            Err(e) => Err(e),
        };
        self.record(&mut supervisor);
        result
    }

    /// Write `line`, then read until the reply carrying `id` arrives.
    ///
    /// Replies to earlier, timed-out requests and messages the child sends on
    /// its own are skipped. Without an `id` the first line is the reply.
    async fn exchange(
        supervisor: &mut ProcessSupervisor,
        line: &str,
        id: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value> {
        Self::ensure_running(supervisor).await?;

        let handle = supervisor.handle_mut().ok_or(AdapterError::NotRunning)?;
        handle.write_line(line).await?;

        // A slow child is left alone; only a dead one is restarted, on the next call
        let deadline = Instant::now() + timeout;
        loop {
            let response = match tokio::time::timeout_at(deadline, handle.read_line()).await {
                Ok(read) => read?.ok_or(AdapterError::NoResponse)?,
                Err(_) => return Err(AdapterError::Timeout { after: timeout }),
            };
            if response.trim().is_empty() {
                continue;
            }

            let value: Value = serde_json::from_str(response.trim_end()).map_err(|e| {
                AdapterError::InvalidResponse(format!("{} in {:?}", e, preview(&response)))
            })?;

            match id {
                Some(id) if value.get("id") != Some(id) => {
                    tracing::debug!("Discarding unrelated message from MCP server: {}", preview(&response));
                }
                _ => return Ok(value),
            }
        }
    }

    /// Restart once if the child died; give up with `NotRunning` if that fails
    async fn ensure_running(supervisor: &mut ProcessSupervisor) -> Result<()> {
        if supervisor.is_healthy() {
            return Ok(());
        }

        tracing::warn!("MCP server process is not running");
        if let Err(e) = supervisor.restart().await {
            tracing::error!("Restarting MCP server failed: {}", e);
            return Err(AdapterError::NotRunning);
        }

        if supervisor.is_healthy() {
            Ok(())
        } else {
            Err(AdapterError::NotRunning)
        }
    }

    fn record(&self, supervisor: &mut ProcessSupervisor) {
        let status = SupervisorStatus::observe(supervisor);
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Current status, without waiting behind an in-flight request
    pub fn status(&self) -> SupervisorStatus {
        match self.supervisor.try_lock() {
            Ok(mut supervisor) => {
                let status = SupervisorStatus::observe(&mut supervisor);
                *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status.clone();
                status
            }
            Err(_) => self
                .status
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status().running
    }

    /// Stop the child and clear the package cache
    pub async fn shutdown(&self) {
        let mut supervisor = self.supervisor.lock().await;
        supervisor.cleanup().await;
        self.record(&mut supervisor);
    }
}

fn preview(line: &str) -> String {
    const MAX: usize = 200;
    let line = line.trim_end();
    match line.char_indices().nth(MAX) {
        Some((end, _)) => format!("{}...", &line[..end]),
        None => line.to_string(),
    }
}
