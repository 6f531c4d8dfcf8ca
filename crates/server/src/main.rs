use anyhow::{Context, Result};
use clap::Parser;
use mcpod_core::AdapterSettings;
use std::sync::Arc;

mod api;
mod config;
mod middleware;

use config::AppState;
use middleware::auth::{self, AuthMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "mcpod-adapter")]
#[command(about = "Expose a stdio MCP server over HTTP", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "8000")]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Log output format
    #[arg(long, env = "MCP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Authentication required on /mcp
    #[arg(long, env = "MCP_AUTH_MODE", value_enum, default_value_t = AuthMode::None)]
    auth_mode: AuthMode,

    /// Token for bearer authentication
    #[arg(long, env = "MCP_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mcpod_core=info,mcpod_server=info,tower_http=info".into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    tracing::info!("Starting MCP adapter v{}", env!("CARGO_PKG_VERSION"));

    let auth = auth::provider_for(args.auth_mode, args.auth_token)?;
    tracing::info!("Authentication: {}", auth.name());

    let settings = AdapterSettings::from_env().context("Invalid adapter configuration")?;
    tracing::info!(
        "Adapting {} ({} {})",
        settings.server.name,
        settings.server.executable,
        settings.server.args.join(" ")
    );

    let state = Arc::new(AppState::new(auth));
    let addr = format!("{}:{}", args.host, args.port);

    api::serve(&addr, state, settings).await
}
