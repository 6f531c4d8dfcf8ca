// Adapter startup configuration, read from the pod environment

use crate::bridge::BridgeTimeouts;
use crate::error::{AdapterError, Result};
use crate::supervisor::SupervisorOptions;
use mcpod_mcp::CapabilityKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_SERVER_NAME: &str = "MCP_SERVER_NAME";
pub const ENV_EXECUTABLE: &str = "MCP_EXECUTABLE";
pub const ENV_ARGS: &str = "MCP_ARGS";
pub const ENV_WORKING_DIR: &str = "MCP_WORKING_DIR";
pub const ENV_TOOLS: &str = "MCP_TOOLS";
pub const ENV_RESOURCES: &str = "MCP_RESOURCES";
pub const ENV_PROMPTS: &str = "MCP_PROMPTS";
pub const ENV_FORWARD_VARS: &str = "MCP_ENV_VARS";
pub const ENV_FORWARD_PREFIX: &str = "MCP_ENV_";
pub const ENV_PACKAGE_CACHE_DIR: &str = "MCP_PACKAGE_CACHE_DIR";
pub const ENV_NODE_BINARY: &str = "MCP_NODE_BINARY";
pub const ENV_STARTUP_GRACE_MS: &str = "MCP_STARTUP_GRACE_MS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "MCP_REQUEST_TIMEOUT_SECS";
pub const ENV_INIT_TIMEOUT_SECS: &str = "MCP_INIT_TIMEOUT_SECS";
pub const ENV_MAX_MESSAGE_BYTES: &str = "MCP_MAX_MESSAGE_BYTES";

fn default_server_name() -> String {
    "unknown-server".to_string()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_package_cache_dir() -> PathBuf {
    PathBuf::from("/tmp/mcp-packages")
}

fn default_node_binary() -> String {
    "node".to_string()
}

/// How to run the wrapped MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,

    pub executable: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_working_dir", rename = "workingDir")]
    pub working_dir: PathBuf,

    /// Extra variables for the child, layered over the adapter's own environment
    #[serde(default, skip_serializing)]
    pub environment: HashMap<String, String>,
}

impl ServerConfig {
    pub fn new(executable: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: default_server_name(),
            executable: executable.into(),
            args,
            working_dir: default_working_dir(),
            environment: HashMap::new(),
        }
    }

    /// File name of the executable, so `/usr/bin/npx` and `npx` compare equal
    pub fn program_name(&self) -> &str {
        program_name(&self.executable)
    }
}

pub(crate) fn program_name(executable: &str) -> &str {
    executable.rsplit('/').next().unwrap_or(executable)
}

/// Capability entries declared for the wrapped server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub resources: Vec<Value>,
    #[serde(default)]
    pub prompts: Vec<Value>,
}

impl Capabilities {
    pub fn entries(&self, kind: CapabilityKind) -> &[Value] {
        match kind {
            CapabilityKind::Tools => &self.tools,
            CapabilityKind::Resources => &self.resources,
            CapabilityKind::Prompts => &self.prompts,
        }
    }

    /// Entry count per capability kind, keyed by kind name
    pub fn counts(&self) -> HashMap<String, usize> {
        CapabilityKind::ALL
            .into_iter()
            .map(|kind| (kind.as_str().to_string(), self.entries(kind).len()))
            .collect()
    }
}

/// Everything the adapter needs at startup
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub server: ServerConfig,
    pub capabilities: Capabilities,
    /// Writable root for package installs and package-manager caches
    pub package_cache_dir: PathBuf,
    /// Interpreter used when an npx invocation is rewritten to its entry point
    pub node_binary: String,
    pub supervisor: SupervisorOptions,
    pub timeouts: BridgeTimeouts,
}

impl AdapterSettings {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            capabilities: Capabilities::default(),
            package_cache_dir: default_package_cache_dir(),
            node_binary: default_node_binary(),
            supervisor: SupervisorOptions::default(),
            timeouts: BridgeTimeouts::default(),
        }
    }

    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load settings from an explicit set of environment variables
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let executable = get(ENV_EXECUTABLE)
            .ok_or_else(|| {
                AdapterError::Config(format!("{} environment variable is required", ENV_EXECUTABLE))
            })?
            .to_string();

        let server = ServerConfig {
            name: get(ENV_SERVER_NAME)
                .map(str::to_string)
                .unwrap_or_else(default_server_name),
            executable,
            args: get(ENV_ARGS).map(parse_args).unwrap_or_default(),
            working_dir: get(ENV_WORKING_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(default_working_dir),
            environment: forwarded_environment(&vars),
        };

        let capabilities = Capabilities {
            tools: parse_capability(ENV_TOOLS, get(ENV_TOOLS)),
            resources: parse_capability(ENV_RESOURCES, get(ENV_RESOURCES)),
            prompts: parse_capability(ENV_PROMPTS, get(ENV_PROMPTS)),
        };

        let mut supervisor = SupervisorOptions::default();
        if let Some(ms) = parse_number(ENV_STARTUP_GRACE_MS, get(ENV_STARTUP_GRACE_MS))? {
            supervisor.startup_grace = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_number(ENV_MAX_MESSAGE_BYTES, get(ENV_MAX_MESSAGE_BYTES))? {
            supervisor.max_message_bytes = usize::try_from(bytes).unwrap_or(usize::MAX);
        }

        let mut timeouts = BridgeTimeouts::default();
        if let Some(secs) = parse_number(ENV_REQUEST_TIMEOUT_SECS, get(ENV_REQUEST_TIMEOUT_SECS))? {
            timeouts.request = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_number(ENV_INIT_TIMEOUT_SECS, get(ENV_INIT_TIMEOUT_SECS))? {
            timeouts.initialize = Duration::from_secs(secs);
        }

        Ok(Self {
            server,
            capabilities,
            package_cache_dir: get(ENV_PACKAGE_CACHE_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(default_package_cache_dir),
            node_binary: get(ENV_NODE_BINARY)
                .map(str::to_string)
                .unwrap_or_else(default_node_binary),
            supervisor,
            timeouts,
        })
    }
}

/// `MCP_ARGS` is a JSON array of strings, with a comma-separated fallback
fn parse_args(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(args) => args,
        Err(_) => raw
            .split(',')
            .map(str::trim)
            .filter(|arg| !arg.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

fn parse_capability(key: &str, raw: Option<&str>) -> Vec<Value> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    match serde_json::from_str::<Vec<Value>>(raw) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Ignoring {}: not a JSON array ({})", key, e);
            Vec::new()
        }
    }
}

fn parse_number(key: &str, raw: Option<&str>) -> Result<Option<u64>> {
    raw.map(|value| {
        value
            .parse::<u64>()
            .map_err(|_| AdapterError::Config(format!("{} must be a whole number, got {:?}", key, value)))
    })
    .transpose()
}

/// Variables named by `MCP_ENV_VARS` plus every `MCP_ENV_*` variable with the prefix stripped
fn forwarded_environment(vars: &HashMap<String, String>) -> HashMap<String, String> {
    let mut environment = HashMap::new();

    if let Some(raw) = vars.get(ENV_FORWARD_VARS) {
        match serde_json::from_str::<Vec<String>>(raw) {
            Ok(names) => {
                for name in names {
                    if let Some(value) = vars.get(&name) {
                        environment.insert(name, value.clone());
                    }
                }
            }
            Err(e) => tracing::warn!("Ignoring {}: not a JSON array of names ({})", ENV_FORWARD_VARS, e),
        }
    }

    for (key, value) in vars {
        if key == ENV_FORWARD_VARS {
            continue;
        }
        if let Some(name) = key.strip_prefix(ENV_FORWARD_PREFIX) {
            if !name.is_empty() {
                environment.insert(name.to_string(), value.clone());
            }
        }
    }

    environment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_executable_is_required() {
        let err = AdapterSettings::from_vars(vars(&[("MCP_SERVER_NAME", "demo")])).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
        assert!(err.to_string().contains("MCP_EXECUTABLE"));
    }

    #[test]
    fn test_defaults() {
        let settings = AdapterSettings::from_vars(vars(&[("MCP_EXECUTABLE", "my-server")])).unwrap();

        assert_eq!(settings.server.name, "unknown-server");
        assert_eq!(settings.server.executable, "my-server");
        assert!(settings.server.args.is_empty());
        assert_eq!(settings.server.working_dir, PathBuf::from("/tmp"));
        assert!(settings.server.environment.is_empty());
        assert_eq!(settings.capabilities, Capabilities::default());
        assert_eq!(settings.supervisor.startup_grace, Duration::from_secs(3));
        assert_eq!(settings.timeouts.request, Duration::from_secs(30));
        assert_eq!(settings.timeouts.initialize, Duration::from_secs(60));
    }

    #[test]
    fn test_args_json_and_comma_fallback() {
        assert_eq!(parse_args(r#"["-y","some-pkg"]"#), vec!["-y", "some-pkg"]);
        assert_eq!(parse_args("-y, some-pkg ,"), vec!["-y", "some-pkg"]);
        assert_eq!(parse_args(r#"["a,b"]"#), vec!["a,b"]);
    }

    #[test]
    fn test_capabilities_parse_failure_yields_empty() {
        let settings = AdapterSettings::from_vars(vars(&[
            ("MCP_EXECUTABLE", "srv"),
            ("MCP_TOOLS", r#"[{"name":"echo"},{"name":"add"}]"#),
            ("MCP_RESOURCES", "{not json"),
        ]))
        .unwrap();

        assert_eq!(settings.capabilities.tools.len(), 2);
        assert!(settings.capabilities.resources.is_empty());
        assert!(settings.capabilities.prompts.is_empty());

        let counts = settings.capabilities.counts();
        assert_eq!(counts["tools"], 2);
        assert_eq!(counts["resources"], 0);
        assert_eq!(counts["prompts"], 0);
    }

    #[test]
    fn test_environment_forwarding() {
        let settings = AdapterSettings::from_vars(vars(&[
            ("MCP_EXECUTABLE", "srv"),
            ("MCP_ENV_VARS", r#"["GITHUB_TOKEN","MISSING"]"#),
            ("GITHUB_TOKEN", "ghp_123"),
            ("MCP_ENV_API_KEY", "secret"),
            ("MCP_ENV_", "ignored"),
            ("UNRELATED", "x"),
        ]))
        .unwrap();

        let env = &settings.server.environment;
        assert_eq!(env.get("GITHUB_TOKEN").map(String::as_str), Some("ghp_123"));
        assert_eq!(env.get("API_KEY").map(String::as_str), Some("secret"));
        // MCP_ENV_VARS itself must not leak as a variable named "VARS"
        assert!(!env.contains_key("VARS"));
        assert!(!env.contains_key("MISSING"));
        assert!(!env.contains_key("UNRELATED"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_tunables() {
        let settings = AdapterSettings::from_vars(vars(&[
            ("MCP_EXECUTABLE", "srv"),
            ("MCP_STARTUP_GRACE_MS", "250"),
            ("MCP_REQUEST_TIMEOUT_SECS", "5"),
            ("MCP_INIT_TIMEOUT_SECS", "10"),
            ("MCP_PACKAGE_CACHE_DIR", "/var/cache/mcp"),
            ("MCP_MAX_MESSAGE_BYTES", "65536"),
        ]))
        .unwrap();

        assert_eq!(settings.supervisor.startup_grace, Duration::from_millis(250));
        assert_eq!(settings.timeouts.request, Duration::from_secs(5));
        assert_eq!(settings.timeouts.initialize, Duration::from_secs(10));
        assert_eq!(settings.package_cache_dir, PathBuf::from("/var/cache/mcp"));
        assert_eq!(settings.supervisor.max_message_bytes, 65536);

        let err = AdapterSettings::from_vars(vars(&[
            ("MCP_EXECUTABLE", "srv"),
            ("MCP_REQUEST_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn test_program_name_strips_directories() {
        let config = ServerConfig::new("/usr/local/bin/npx", vec![]);
        assert_eq!(config.program_name(), "npx");
        assert_eq!(program_name("uvx"), "uvx");
    }
}
