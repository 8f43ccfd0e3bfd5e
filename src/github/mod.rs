//! Source host integration.
//!
//! Deterministic, non-agent-controlled version control: repository creation
//! through the GitHub API, git flows executed inside the sandbox, Actions
//! secret installation, and the post-agent file injections.

pub mod api;
pub mod git;
pub mod inject;

use anyhow::Result;
use sqlx::PgConnection;

use crate::db::models::PushHistory;
use crate::db::Store;
use crate::ledger::{action, Ledger, NewActivity};
use crate::util::{epoch_seconds, new_id};

pub use api::{GithubApi, RepoInfo};
pub use git::PushOutcome;

/// Record a completed push: one push-history row plus a `github_push`
/// activity entry referencing it.
pub async fn record_push(
    store: &Store,
    ledger: &Ledger,
    conn: &mut PgConnection,
    project_id: &str,
    user_id: &str,
    environment: &str,
    outcome: &PushOutcome,
    commit_message: &str,
) -> Result<String> {
    let push = PushHistory {
        push_id: new_id(),
        project_id: project_id.to_string(),
        commit_sha: outcome.commit_sha.clone(),
        commit_message: commit_message.to_string(),
        files_changed: outcome.files.clone(),
        repo_url: outcome.remote_url.clone(),
        environment: environment.to_string(),
        pushed_at: epoch_seconds(),
    };
    store.insert_push_history(conn, &push).await?;

    ledger
        .record_activity(
            conn,
            NewActivity {
                project_id,
                user_id,
                request_id: None,
                action_type: action::GITHUB_PUSH,
                action_details: format!(
                    "Pushed {} ({} files) to {}",
                    &outcome.commit_sha[..outcome.commit_sha.len().min(12)],
                    outcome.files.len(),
                    outcome.remote_url
                ),
                status: "success",
                reference_ids: serde_json::json!({
                    "github_push_id": push.push_id,
                    "commit_sha": outcome.commit_sha,
                }),
            },
        )
        .await;

    Ok(push.push_id)
}
