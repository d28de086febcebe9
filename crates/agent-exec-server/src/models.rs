//! Request and response bodies for the `/workspace` routes.
//!
//! These shapes are the HTTP contract with the orchestrator; any change here
//! must be mirrored in its client DTOs.

use serde::{Deserialize, Serialize};

fn default_git_ref() -> String {
    "HEAD".to_string()
}

fn default_timeout_sec() -> u64 {
    60
}

/// Clone a repository into a new workspace.
#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceRequest {
    /// Stable identifier for the workspace (typically the job id).
    pub workspace_ref: String,
    /// Git clone URL (https, ssh, or file).
    pub repo_url: String,
    /// Branch, tag, or full commit hash to check out.
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
}

/// Generic success response for lifecycle operations.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkspaceResponse {
    pub workspace_ref: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub workspace_ref: String,
}

/// `snapshot_key` is opaque: the orchestrator stores it and passes it back
/// verbatim to `/restore`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub workspace_ref: String,
    pub snapshot_key: String,
    pub size_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub workspace_ref: String,
    pub snapshot_key: String,
}

/// Execute one code action in the named workspace.
#[derive(Debug, Deserialize)]
pub struct RunCodeRequest {
    /// The code block emitted by the agent.
    pub code: String,
    pub workspace_ref: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}
