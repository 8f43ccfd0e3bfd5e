//! Pipeline orchestration.
//!
//! Two sibling state machines (creation, modification) plus the secret-sync
//! processor. Each job acquires one control-database connection, runs every
//! mutating write inside one outer transaction on it, and always produces
//! exactly one terminal message on its stream id.

pub mod context;
pub mod creation;
pub mod modification;
pub mod secret_sync;

use std::sync::Arc;

use serde::Deserialize;
use sqlx::PgPool;

use crate::agent::commands::{FileKind, ModifiedFile};
use crate::agent::integrations::IntegrationStore;
use crate::bus::Publisher;
use crate::config::WorkerConfig;
use crate::db::Store;
use crate::deploy::FlyApi;
use crate::github::GithubApi;
use crate::ledger::{action, Ledger};
use crate::llm::LlmClient;
use crate::sandbox::SandboxProvider;

/// Process-wide dependencies injected into every job processor.
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub pool: PgPool,
    pub store: Store,
    pub ledger: Ledger,
    pub publisher: Publisher,
    /// Model driving the agentic loop.
    pub agent_llm: Arc<dyn LlmClient>,
    /// Cheaper model for classifiers and the schema designer.
    pub detector_llm: Arc<dyn LlmClient>,
    pub sandboxes: Arc<dyn SandboxProvider>,
    pub github: Arc<GithubApi>,
    pub fly: Arc<FlyApi>,
    pub integrations: Arc<IntegrationStore>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationParams {
    pub user_prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationPayload {
    pub project_id: String,
    pub user_id: String,
    /// Generated on first touch when the front end did not assign one.
    #[serde(default)]
    pub request_id: Option<String>,
    pub stream_id: String,
    pub request_params: CreationParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationParams {
    pub modification_request: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationPayload {
    pub project_id: String,
    pub user_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub stream_id: String,
    pub request_params: ModificationParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSyncParams {
    pub secret_name: String,
    pub secret_value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSyncPayload {
    pub project_id: String,
    pub user_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub stream_id: String,
    pub request_params: SecretSyncParams,
}

/// Classify a modification run from its modified files: new route files win,
/// then changed route files, then everything else is business logic.
pub fn classify_modification(files: &[ModifiedFile]) -> &'static str {
    let new_routes = files
        .iter()
        .any(|f| f.kind == FileKind::Route && f.is_new);
    if new_routes {
        return action::ENDPOINTS_ADDED;
    }
    let changed_routes = files
        .iter()
        .any(|f| f.kind == FileKind::Route && !f.is_new);
    if changed_routes {
        return action::ENDPOINTS_MODIFIED;
    }
    action::BUSINESS_LOGIC_MODIFIED
}

/// Render "METHOD /path" pairs for an endpoints activity entry.
pub fn describe_routes(files: &[ModifiedFile]) -> Vec<String> {
    files
        .iter()
        .filter(|f| f.kind == FileKind::Route)
        .filter_map(|f| context::endpoint_from_path(&f.path))
        .map(|e| format!("{} {}", e.method, e.path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, is_new: bool) -> ModifiedFile {
        ModifiedFile {
            path: path.to_string(),
            kind: FileKind::classify(path),
            is_new,
        }
    }

    #[test]
    fn test_classify_new_route_wins() {
        let files = vec![
            file("server/api/users/[id].get.js", true),
            file("server/api/users/index.get.js", false),
            file("server/utils/db.js", false),
        ];
        assert_eq!(classify_modification(&files), action::ENDPOINTS_ADDED);
    }

    #[test]
    fn test_classify_changed_route() {
        let files = vec![
            file("server/api/users/index.get.js", false),
            file("server/utils/helpers.js", true),
        ];
        assert_eq!(classify_modification(&files), action::ENDPOINTS_MODIFIED);
    }

    #[test]
    fn test_classify_business_logic_only() {
        let files = vec![file("server/utils/helpers.js", false)];
        assert_eq!(classify_modification(&files), action::BUSINESS_LOGIC_MODIFIED);
    }

    #[test]
    fn test_classify_empty_is_business_logic() {
        assert_eq!(classify_modification(&[]), action::BUSINESS_LOGIC_MODIFIED);
    }

    #[test]
    fn test_describe_routes() {
        let files = vec![
            file("server/api/users/index.get.js", true),
            file("server/utils/db.js", true),
        ];
        assert_eq!(describe_routes(&files), vec!["GET /api/users"]);
    }

    #[test]
    fn test_creation_payload_decoding() {
        let value = serde_json::json!({
            "projectId": "p1",
            "userId": "u1",
            "streamId": "s1",
            "requestParams": {"userPrompt": "make a weather passthrough API"}
        });
        let payload: CreationPayload = serde_json::from_value(value).unwrap();
        assert_eq!(payload.project_id, "p1");
        assert!(payload.request_id.is_none());
        assert_eq!(payload.request_params.user_prompt, "make a weather passthrough API");
    }

    #[test]
    fn test_secret_sync_payload_decoding() {
        let value = serde_json::json!({
            "projectId": "p9",
            "userId": "u9",
            "requestId": "r9",
            "streamId": "s9",
            "requestParams": {"secretName": "CLERK_SECRET_KEY", "secretValue": "sk_live_x"}
        });
        let payload: SecretSyncPayload = serde_json::from_value(value).unwrap();
        assert_eq!(payload.request_params.secret_name, "CLERK_SECRET_KEY");
        assert_eq!(payload.request_id.as_deref(), Some("r9"));
    }
}
