// Just-in-time package installation, memoized per adapter process

use super::sandbox::{sandbox_env, PackageManager};
use super::{sanitize_name, PackageSpec, PackageType};
use crate::error::{AdapterError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;

/// A subprocess to run to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: Vec<(String, String)>) -> Self {
        self.env.extend(env);
        self
    }
}

/// Captured result of an [`Invocation`]
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs installer subprocesses
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Resolve a program name the way a shell would
    fn find_executable(&self, name: &str) -> Option<PathBuf> {
        find_on_path(name)
    }
}

/// Runs invocations as real child processes with stdin closed
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Look a program up on `PATH`; names containing a slash are checked directly
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug, Deserialize)]
struct NpmManifest {
    #[serde(default)]
    bin: Option<NpmBin>,
    #[serde(default)]
    main: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NpmBin {
    Single(String),
    Named(BTreeMap<String, String>),
}

impl NpmManifest {
    /// Relative path of the file to run: the `bin` entry named after the package,
    /// else the first `bin` entry, else `main`, else `index.js`
    fn entry_point(self, package: &str) -> String {
        let unscoped = package.rsplit('/').next().unwrap_or(package);

        let from_bin = match self.bin {
            Some(NpmBin::Single(path)) => Some(path),
            Some(NpmBin::Named(mut bins)) => bins
                .remove(unscoped)
                .or_else(|| bins.into_values().next()),
            None => None,
        };

        from_bin
            .or(self.main)
            .unwrap_or_else(|| "index.js".to_string())
    }
}

/// Ensures packages are present on disk, at most once per cache key
pub struct PackageInstaller {
    runner: Arc<dyn CommandRunner>,
    cache_dir: PathBuf,
    // cache key -> install directory for npm, source otherwise
    installed: Mutex<HashMap<String, String>>,
}

impl PackageInstaller {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_runner(cache_dir, Arc::new(ProcessRunner))
    }

    pub fn with_runner(cache_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            cache_dir: cache_dir.into(),
            installed: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Install `spec` unless it was already installed by this process.
    ///
    /// The cache lock is held for the whole install so concurrent callers for
    /// the same package never run the installer twice.
    pub async fn install(&self, spec: &PackageSpec) -> Result<()> {
        let key = spec.cache_key();
        let mut installed = self.installed.lock().await;

        if installed.contains_key(&key) {
            tracing::debug!("Package {} already installed", key);
            return Ok(());
        }

        tracing::info!("Installing package {}", key);

        let value = match spec.package_type {
            PackageType::Npm => self.install_npm(spec, &key).await?,
            PackageType::Pypi => self.install_pypi(spec, &key).await?,
            PackageType::Github => self.install_github(spec, &key).await?,
            PackageType::Executable => self.verify_executable(spec, &key)?,
        };

        tracing::info!("Package {} ready", key);
        installed.insert(key, value);

        Ok(())
    }

    async fn install_npm(&self, spec: &PackageSpec, key: &str) -> Result<String> {
        let prefix = self.cache_dir.join("npm").join(sanitize_name(&spec.source));
        tokio::fs::create_dir_all(&prefix)
            .await
            .map_err(|e| AdapterError::install(key, format!("cannot create {}: {}", prefix.display(), e)))?;

        let prefix_str = prefix.to_string_lossy().into_owned();
        let mut args = vec![
            "install".to_string(),
            "--prefix".to_string(),
            prefix_str.clone(),
            "--no-audit".to_string(),
            "--no-fund".to_string(),
            "--no-save".to_string(),
            "--loglevel=error".to_string(),
        ];
        args.extend(spec.install_args.iter().cloned());
        args.push(spec.requirement("@"));

        let invocation = Invocation::new("npm", args)
            .current_dir(&prefix)
            .envs(sandbox_env(PackageManager::Npm, &self.cache_dir));

        self.run_checked(key, &invocation).await?;
        Ok(prefix_str)
    }

    async fn install_pypi(&self, spec: &PackageSpec, key: &str) -> Result<String> {
        let mut args = vec![
            "pip".to_string(),
            "install".to_string(),
            "--system".to_string(),
            "--cache-dir".to_string(),
            self.cache_dir.join("uv-cache").to_string_lossy().into_owned(),
        ];
        args.extend(spec.install_args.iter().cloned());
        args.push(spec.requirement("=="));

        let invocation =
            Invocation::new("uv", args).envs(sandbox_env(PackageManager::Uv, &self.cache_dir));

        self.run_checked(key, &invocation).await?;
        Ok(spec.source.clone())
    }

    async fn install_github(&self, spec: &PackageSpec, key: &str) -> Result<String> {
        let repo = repo_name(&spec.source);
        let target = self.cache_dir.join("github").join(sanitize_name(repo));

        if target.exists() {
            tracing::info!("Repository already cloned at {}", target.display());
            return Ok(spec.source.clone());
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AdapterError::install(key, format!("cannot create {}: {}", parent.display(), e)))?;
        }

        let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
        if let Some(reference) = &spec.version {
            args.push("--branch".to_string());
            args.push(reference.clone());
        }
        args.extend(spec.install_args.iter().cloned());
        args.push(spec.source.clone());
        args.push(target.to_string_lossy().into_owned());

        let clone = Invocation::new("git", args).envs(vec![(
            "GIT_TERMINAL_PROMPT".to_string(),
            "0".to_string(),
        )]);
        self.run_checked(key, &clone).await?;

        if target.join("package.json").exists() {
            tracing::info!("Installing node dependencies for {}", repo);
            let deps = Invocation::new("npm", ["install", "--no-audit", "--no-fund"])
                .current_dir(&target)
                .envs(sandbox_env(PackageManager::Npm, &self.cache_dir));
            self.run_checked(key, &deps).await?;
        }

        Ok(spec.source.clone())
    }

    fn verify_executable(&self, spec: &PackageSpec, key: &str) -> Result<String> {
        match self.runner.find_executable(&spec.source) {
            Some(path) => {
                tracing::debug!("Found {} at {}", spec.source, path.display());
                Ok(spec.source.clone())
            }
            None => Err(AdapterError::install(
                key,
                format!("{} not found on PATH", spec.source),
            )),
        }
    }

    async fn run_checked(&self, key: &str, invocation: &Invocation) -> Result<CommandOutput> {
        tracing::debug!("Running {} {}", invocation.program, invocation.args.join(" "));

        let output = self
            .runner
            .run(invocation)
            .await
            .map_err(|e| AdapterError::install(key, format!("failed to run {}: {}", invocation.program, e)))?;

        if !output.success {
            let stderr = output.stderr.trim();
            let message = if stderr.is_empty() {
                format!("{} exited with an error", invocation.program)
            } else {
                stderr.to_string()
            };
            return Err(AdapterError::install(key, message));
        }

        Ok(output)
    }

    /// Absolute path of the script an installed npm package runs
    pub async fn resolve_entry_point(&self, spec: &PackageSpec) -> Result<PathBuf> {
        let entry_error = |message: String| AdapterError::EntryPoint {
            package: spec.source.clone(),
            message,
        };

        let prefix = {
            let installed = self.installed.lock().await;
            installed
                .get(&spec.cache_key())
                .cloned()
                .ok_or_else(|| entry_error("package is not installed".to_string()))?
        };

        let package_dir = Path::new(&prefix).join("node_modules").join(&spec.source);
        let manifest_path = package_dir.join("package.json");

        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| entry_error(format!("cannot read {}: {}", manifest_path.display(), e)))?;
        let manifest: NpmManifest = serde_json::from_str(&raw)
            .map_err(|e| entry_error(format!("invalid {}: {}", manifest_path.display(), e)))?;

        let entry = package_dir.join(manifest.entry_point(&spec.source));
        if !entry.is_file() {
            return Err(entry_error(format!("{} does not exist", entry.display())));
        }

        Ok(entry)
    }

    /// Cache keys of everything installed so far, sorted
    pub async fn installed_keys(&self) -> Vec<String> {
        let installed = self.installed.lock().await;
        let mut keys: Vec<String> = installed.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Delete the on-disk package cache and forget every installation
    pub async fn clear_cache(&self) {
        let mut installed = self.installed.lock().await;

        match tokio::fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => tracing::info!("Removed package cache {}", self.cache_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove package cache {}: {}",
                self.cache_dir.display(),
                e
            ),
        }

        installed.clear();
    }
}

/// Last path segment of a repository URL without `.git`
fn repo_name(url: &str) -> &str {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed);
    last.strip_suffix(".git").unwrap_or(last)
}
