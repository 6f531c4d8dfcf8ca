// Core of the universal MCP adapter: just-in-time package installation,
// child process supervision and the stdio JSON-RPC bridge

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod error;
pub mod package;
pub mod supervisor;

pub use adapter::{HealthReport, HealthStatus, McpBackend, UniversalAdapter};
pub use bridge::{BridgeTimeouts, JsonRpcBridge, SupervisorStatus};
pub use config::{AdapterSettings, Capabilities, ServerConfig};
pub use error::{AdapterError, Result};
pub use package::{PackageInstaller, PackageSpec, PackageType};
pub use supervisor::{ProcessSupervisor, SupervisorOptions};
