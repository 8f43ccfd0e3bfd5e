//! Stored records for the control database.
//!
//! All identifiers are opaque nano-id strings; all timestamps are integer
//! seconds since the epoch. The project is the aggregate root: every record
//! references it by id, no cycles.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One row per ingested request. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub request_id: String,
    pub project_id: String,
    pub user_id: String,
    pub intent: String,
    pub request_params: serde_json::Value,
    pub status: String,
    pub created_at: i64,
}

/// Per-project provisioned database. At most one active row per project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDatabase {
    pub database_id: String,
    pub project_id: String,
    pub user_id: String,
    pub db_name: String,
    pub schema_name: String,
    pub environment: String,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Executed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "executed" => Ok(Self::Executed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// Audit row for one DDL execution attempt against a project database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub query_id: String,
    pub project_id: String,
    pub query_text: String,
    pub query_type: String,
    /// Name of the target table.
    pub schema_name: String,
    pub execution_status: ExecutionStatus,
    pub error_message: Option<String>,
    pub environment: String,
    pub created_at: i64,
}

/// Source repository for a project. At most one active row per project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubRepo {
    pub repo_id: String,
    pub project_id: String,
    pub user_id: String,
    pub repo_url: String,
    pub repo_name: String,
    pub branch: String,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushHistory {
    pub push_id: String,
    pub project_id: String,
    pub commit_sha: String,
    pub commit_message: String,
    pub files_changed: Vec<String>,
    pub repo_url: String,
    pub environment: String,
    pub pushed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// One sandbox lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSession {
    pub session_id: String,
    pub project_id: String,
    pub container_id: String,
    pub provider: String,
    pub status: SessionStatus,
    pub environment: String,
    pub started_at: i64,
    pub stopped_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deployed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "deployed" => Ok(Self::Deployed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: String,
    pub project_id: String,
    pub platform: String,
    pub app_name: String,
    pub url: String,
    pub status: DeploymentStatus,
    pub deployed_at: i64,
    pub last_updated: i64,
}

/// Append-only activity ledger entry. `reference_ids` carries the opaque ids
/// of related records for later joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub action_id: String,
    pub project_id: String,
    pub user_id: String,
    pub request_id: Option<String>,
    pub action_type: String,
    pub action_details: String,
    pub status: String,
    pub environment: String,
    pub reference_ids: serde_json::Value,
    pub created_at: i64,
}

/// Append-only token/dollar accounting entry for one model call (or one
/// aggregated agentic loop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCost {
    pub cost_id: String,
    pub project_id: String,
    pub job_id: String,
    pub user_id: String,
    pub prompt_content: String,
    pub message_type: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    /// Wall-clock milliseconds for the call(s).
    pub time_to_completion: i64,
    pub started_at: i64,
    pub created_at: i64,
}

/// Latest row per project is authoritative; a file copy also lives in the
/// project repository as `api-blueprint.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiBlueprint {
    pub blueprint_id: String,
    pub project_id: String,
    pub request_id: String,
    pub blueprint_content: serde_json::Value,
    pub last_updated: i64,
    pub created_at: i64,
}

/// Placeholder for a user-supplied integration credential. `value` stays
/// empty until the user provides the real secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPlaceholder {
    pub credential_id: String,
    pub project_id: String,
    pub provider: String,
    pub variable_name: String,
    pub value: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}
