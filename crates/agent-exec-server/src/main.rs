//! Entry point for the executor service.
//!
//! The service runs as an internal deployment behind the orchestrator; the
//! container policy around it (non-root user, read-only root filesystem, no
//! network, process-level kill) is the outermost sandbox layer.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agent_exec::WorkspaceManager;
use agent_exec_server::routes::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "agent-exec-server", about = "Sandboxed code-action executor service")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8001)]
    port: u16,

    /// Base directory for workspaces and snapshots.
    #[arg(long, default_value = "/tmp/agent-exec-workspaces")]
    workspace_base: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let manager = Arc::new(WorkspaceManager::new(&args.workspace_base));
    let app = routes::router(AppState { manager });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        workspace_base = %args.workspace_base.display(),
        "executor service listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
