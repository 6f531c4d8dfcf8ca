// Lifecycle of the single child MCP server process

use crate::config::ServerConfig;
use crate::error::{AdapterError, Result};
use crate::package::{sandbox_env, PackageInstaller, PackageManager};
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Timing knobs for starting and stopping the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// How long a freshly spawned child must survive before it counts as started
    pub startup_grace: Duration,
    /// How long to wait after SIGTERM before killing
    pub shutdown_grace: Duration,
    /// Longest stdout line accepted from the child
    pub max_message_bytes: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(5),
            max_message_bytes: 16 * 1024 * 1024,
        }
    }
}

/// The live child process and its pipes.
///
/// Spawned with `kill_on_drop`, so dropping the handle on any path kills the child.
/// Stdout bytes are buffered here rather than in the reading future, so a read
/// abandoned by a timeout never loses part of a line.
pub(crate) struct ChildHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    pending: Vec<u8>,
    // prefix of `pending` already known to hold no newline
    scanned: usize,
    max_line: usize,
    // inside an oversized line; drop bytes up to its newline
    skipping: bool,
}

impl ChildHandle {
    pub(crate) fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Write one newline-terminated line and flush it
    pub(crate) async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read one line, `None` at end of stream.
    ///
    /// Cancel safe: bytes read before the future is dropped stay in `pending`.
    /// A line longer than `max_line` is an `InvalidResponse` and is skipped.
    pub(crate) async fn read_line(&mut self) -> Result<Option<String>> {
        let mut chunk = [0u8; 8192];
        loop {
            let newline = self.pending[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|offset| self.scanned + offset);

            if let Some(newline) = newline {
                let line: Vec<u8> = self.pending.drain(..=newline).collect();
                self.scanned = 0;
                if self.skipping {
                    self.skipping = false;
                    continue;
                }
                if newline > self.max_line {
                    return Err(self.oversized());
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.skipping {
                self.pending.clear();
            } else if self.pending.len() > self.max_line {
                self.pending.clear();
                self.scanned = 0;
                self.skipping = true;
                return Err(self.oversized());
            }
            self.scanned = self.pending.len();

            let read = self.stdout.read(&mut chunk).await?;
            if read == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&chunk[..read]);
        }
    }

    fn oversized(&self) -> AdapterError {
        AdapterError::InvalidResponse(format!("response line exceeds {} bytes", self.max_line))
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Errors are logged, never returned.
    async fn terminate(self, grace: Duration) {
        let Self {
            mut child,
            stdin,
            stdout,
            ..
        } = self;
        drop(stdin);
        drop(stdout);

        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!("MCP server already exited ({})", status);
            return;
        }

        send_terminate(&child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => tracing::info!("MCP server stopped ({})", status),
            Ok(Err(e)) => tracing::debug!("Waiting for MCP server failed: {}", e),
            Err(_) => {
                tracing::warn!("MCP server ignored SIGTERM for {:?}, killing it", grace);
                if let Err(e) = child.kill().await {
                    tracing::debug!("Killing MCP server failed: {}", e);
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };

    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!("SIGTERM to pid {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

/// Owns the child process: start, liveness, restart and final cleanup
pub struct ProcessSupervisor {
    config: ServerConfig,
    options: SupervisorOptions,
    installer: Arc<PackageInstaller>,
    handle: Option<ChildHandle>,
    restart_count: u32,
    last_restart: Option<DateTime<Utc>>,
}

impl ProcessSupervisor {
    pub fn new(config: ServerConfig, options: SupervisorOptions, installer: Arc<PackageInstaller>) -> Self {
        Self {
            config,
            options,
            installer,
            handle: None,
            restart_count: 0,
            last_restart: None,
        }
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn last_restart(&self) -> Option<DateTime<Utc>> {
        self.last_restart
    }

    pub fn child_id(&self) -> Option<u32> {
        self.handle.as_ref().and_then(ChildHandle::id)
    }

    pub(crate) fn handle_mut(&mut self) -> Option<&mut ChildHandle> {
        self.handle.as_mut()
    }

    fn build_command(&self) -> Command {
        let mut command = Command::new(&self.config.executable);
        command
            .args(&self.config.args)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // Package-manager caches first so explicitly configured variables win
        if let Some(manager) = PackageManager::for_program(self.config.program_name()) {
            command.envs(sandbox_env(manager, self.installer.cache_dir()));
        }
        command.envs(&self.config.environment);

        command
    }

    /// Spawn the child and make sure it survives the startup grace period
    pub async fn start(&mut self) -> Result<()> {
        if let Some(old) = self.handle.take() {
            old.terminate(self.options.shutdown_grace).await;
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.config.working_dir).await {
            tracing::warn!(
                "Cannot create working directory {}: {}",
                self.config.working_dir.display(),
                e
            );
        }

        tracing::info!(
            "Starting MCP server {}: {} {}",
            self.config.name,
            self.config.executable,
            self.config.args.join(" ")
        );

        let mut child = self.build_command().spawn().map_err(|e| {
            AdapterError::Startup(format!("cannot spawn {}: {}", self.config.executable, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Startup("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Startup("child stdout not captured".to_string()))?;

        tokio::time::sleep(self.options.startup_grace).await;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                return Err(AdapterError::Startup(format!(
                    "{} exited during startup ({})",
                    self.config.executable, status
                )));
            }
            Err(e) => {
                return Err(AdapterError::Startup(format!(
                    "cannot check {} status: {}",
                    self.config.executable, e
                )));
            }
        }

        tracing::info!("MCP server started with pid {:?}", child.id());

        self.handle = Some(ChildHandle {
            child,
            stdin,
            stdout,
            pending: Vec::new(),
            scanned: 0,
            max_line: self.options.max_message_bytes,
            skipping: false,
        });

        Ok(())
    }

    /// Stop whatever is running, ignoring errors, and start again
    pub async fn restart(&mut self) -> Result<()> {
        self.restart_count += 1;
        self.last_restart = Some(Utc::now());
        tracing::warn!("Restarting MCP server (restart #{})", self.restart_count);

        self.stop().await;
        self.start().await
    }

    /// True while the child exists and has not exited
    pub fn is_healthy(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };

        match handle.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!("MCP server exited with code {:?}", status.code());
                false
            }
            Err(e) => {
                tracing::warn!("Cannot poll MCP server status: {}", e);
                false
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.terminate(self.options.shutdown_grace).await;
        }
    }

    /// Final shutdown: stop the child and drop the package cache
    pub async fn cleanup(&mut self) {
        self.stop().await;
        self.installer.clear_cache().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn fast_options() -> SupervisorOptions {
        SupervisorOptions {
            startup_grace: Duration::from_millis(100),
            shutdown_grace: Duration::from_millis(500),
            ..SupervisorOptions::default()
        }
    }

    fn supervisor(temp_dir: &TempDir, executable: &str, args: &[&str]) -> ProcessSupervisor {
        let mut config = ServerConfig::new(executable, args.iter().map(|a| a.to_string()).collect());
        config.working_dir = temp_dir.path().to_path_buf();
        let installer = Arc::new(PackageInstaller::new(temp_dir.path().join("packages")));
        ProcessSupervisor::new(config, fast_options(), installer)
    }

    #[tokio::test]
    async fn test_start_and_health() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(&temp_dir, "cat", &[]);

        assert!(!supervisor.is_healthy());
        supervisor.start().await.unwrap();
        assert!(supervisor.is_healthy());
        assert!(supervisor.child_id().is_some());

        supervisor.cleanup().await;
        assert!(!supervisor.is_healthy());
    }

    #[tokio::test]
    async fn test_start_fails_when_child_exits_early() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(&temp_dir, "true", &[]);

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, AdapterError::Startup(_)));
        assert!(err.to_string().contains("exited during startup"));
        assert!(!supervisor.is_healthy());
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_binary() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(&temp_dir, "definitely-not-a-real-binary-name", &[]);

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, AdapterError::Startup(_)));
    }

    #[tokio::test]
    async fn test_restart_replaces_child() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(&temp_dir, "cat", &[]);

        supervisor.start().await.unwrap();
        let first = supervisor.child_id();

        supervisor.restart().await.unwrap();

        assert!(supervisor.is_healthy());
        assert_ne!(supervisor.child_id(), first);
        assert_eq!(supervisor.restart_count(), 1);
        assert!(supervisor.last_restart().is_some());

        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn test_child_sees_environment_and_working_dir() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(
            &temp_dir,
            "sh",
            &["-c", "printf '%s %s\\n' \"$GREETING\" \"$(pwd)\"; exec cat"],
        );
        supervisor.config.environment =
            HashMap::from([("GREETING".to_string(), "hello".to_string())]);

        supervisor.start().await.unwrap();
        let line = supervisor
            .handle_mut()
            .unwrap()
            .read_line()
            .await
            .unwrap()
            .unwrap();

        let canonical = temp_dir.path().canonicalize().unwrap();
        assert_eq!(line.trim_end(), format!("hello {}", canonical.display()));

        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(&temp_dir, "sh", &["-c", "trap '' TERM; while :; do sleep 1; done"]);

        supervisor.start().await.unwrap();
        supervisor.cleanup().await;

        assert!(supervisor.child_id().is_none());
        assert!(!supervisor.is_healthy());
    }

    #[tokio::test]
    async fn test_cleanup_clears_package_cache() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(&temp_dir, "cat", &[]);
        supervisor
            .installer
            .install(&crate::package::PackageSpec::executable("cat"))
            .await
            .unwrap();

        supervisor.start().await.unwrap();
        supervisor.cleanup().await;

        assert!(supervisor.installer.installed_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_read_line_keeps_bytes_across_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(
            &temp_dir,
            "sh",
            &["-c", "printf '{\"a\":'; sleep 0.5; printf '1}\\n'; exec cat"],
        );
        supervisor.start().await.unwrap();
        let handle = supervisor.handle_mut().unwrap();

        let first = tokio::time::timeout(Duration::from_millis(150), handle.read_line()).await;
        assert!(first.is_err());

        let line = handle.read_line().await.unwrap().unwrap();
        assert_eq!(line, "{\"a\":1}\n");

        supervisor.cleanup().await;
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected_then_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ServerConfig::new(
            "sh",
            vec![
                "-c".to_string(),
                "head -c 4096 /dev/zero | tr '\\0' x; echo; echo '{}'; exec cat".to_string(),
            ],
        );
        config.working_dir = temp_dir.path().to_path_buf();
        let options = SupervisorOptions {
            max_message_bytes: 1024,
            ..fast_options()
        };
        let installer = Arc::new(PackageInstaller::new(temp_dir.path().join("packages")));
        let mut supervisor = ProcessSupervisor::new(config, options, installer);
        supervisor.start().await.unwrap();
        let handle = supervisor.handle_mut().unwrap();

        let err = handle.read_line().await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidResponse(_)));
        assert!(err.to_string().contains("exceeds 1024 bytes"));

        let line = handle.read_line().await.unwrap().unwrap();
        assert_eq!(line, "{}\n");

        supervisor.cleanup().await;
    }
}
