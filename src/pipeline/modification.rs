//! Modification pipeline: apply a natural-language change request to an
//! existing project through a feature branch.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::agent::prompt::{build_system_prompt, PromptContext};
use crate::agent::{record_agent_cost, run_agent_loop};
use crate::bus::TypedMessage;
use crate::db::models::{ContainerSession, RequestLog, SessionStatus};
use crate::detectors::CostMeta;
use crate::errors::PipelineError;
use crate::github::git::{
    clone_for_modification, create_feature_branch, feature_branch_name, finish_modification,
};
use crate::github::record_push;
use crate::ledger::NewActivity;
use crate::queue::{Job, JOB_MODIFICATION};
use crate::sandbox::Sandbox;
use crate::schema::provisioner::apply_agent_ddl;
use crate::util::{epoch_millis, epoch_seconds, new_id};
use crate::worker::JobProcessor;

use super::context::load_project_context;
use super::creation::sandbox_env;
use super::{classify_modification, describe_routes, ModificationPayload, WorkerContext};

/// Blueprint file kept at the repository root.
const BLUEPRINT_PATH: &str = "api-blueprint.json";

#[derive(Default)]
struct Cleanup {
    sandbox: Option<Box<dyn Sandbox>>,
    session_id: Option<String>,
}

pub struct ModificationPipeline {
    ctx: Arc<WorkerContext>,
}

impl ModificationPipeline {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    async fn finish_session(&self, session_id: &str, status: SessionStatus) {
        let result = async {
            let mut conn = self.ctx.pool.acquire().await?;
            self.ctx
                .store
                .finish_container_session(&mut conn, session_id, status, epoch_seconds())
                .await
        }
        .await;
        if let Err(e) = result {
            warn!(session_id, error = %e, "Failed to finalize container session");
        }
    }

    async fn run(
        &self,
        job: &Job,
        payload: &ModificationPayload,
        cleanup: &mut Cleanup,
    ) -> Result<String> {
        let c = &self.ctx;
        let stream = &payload.stream_id;
        let project_id = &payload.project_id;
        let user_id = &payload.user_id;
        let request = &payload.request_params.modification_request;
        let request_id = payload.request_id.clone().unwrap_or_else(new_id);
        let meta = CostMeta {
            project_id: project_id.clone(),
            job_id: job.id.clone(),
            user_id: user_id.clone(),
        };

        // M0: outer transaction.
        let mut tx = c
            .pool
            .begin()
            .await
            .context("Phase M0 (setup): control database unavailable")?;

        c.store
            .insert_request_log(
                &mut tx,
                &RequestLog {
                    request_id: request_id.clone(),
                    project_id: project_id.clone(),
                    user_id: user_id.clone(),
                    intent: JOB_MODIFICATION.to_string(),
                    request_params: serde_json::json!({"modificationRequest": request}),
                    status: "processing".to_string(),
                    created_at: epoch_seconds(),
                },
            )
            .await
            .context("Phase M0 (setup)")?;

        c.publisher
            .publish_progress(stream, "Preparing your project", 5)
            .await;

        // M2: the project must have an active repository. Checked before the
        // sandbox is provisioned so a doomed job fails cheaply.
        let repo = c
            .store
            .active_github_repo(&mut tx, project_id)
            .await
            .context("Phase M2 (repository lookup)")?
            .ok_or(PipelineError::MissingRepository)
            .context("Phase M2 (repository lookup)")?;

        // M1: sandbox.
        let sandbox = c
            .sandboxes
            .provision(project_id, &sandbox_env(&c.config))
            .await
            .context("Phase M1 (sandbox provisioning)")?;
        let session = ContainerSession {
            session_id: new_id(),
            project_id: project_id.clone(),
            container_id: sandbox.id().to_string(),
            provider: c.sandboxes.name().to_string(),
            status: SessionStatus::Active,
            environment: c.config.environment.clone(),
            started_at: epoch_seconds(),
            stopped_at: None,
        };
        {
            let mut conn = c.pool.acquire().await.context("Phase M1 (session record)")?;
            c.store
                .insert_container_session(&mut conn, &session)
                .await
                .context("Phase M1 (session record)")?;
        }
        cleanup.session_id = Some(session.session_id.clone());
        cleanup.sandbox = Some(sandbox);
        let sandbox: &dyn Sandbox = cleanup.sandbox.as_deref().unwrap();
        c.publisher
            .publish_progress(stream, "Sandbox ready", 15)
            .await;

        // M3: fetch and check out the existing project.
        clone_for_modification(
            sandbox,
            &c.config.github_token,
            c.github.owner(),
            &repo.repo_name,
            &repo.branch,
        )
        .await
        .context("Phase M3 (checkout)")?;

        // M4: feature branch.
        let feature_branch = feature_branch_name(epoch_millis());
        create_feature_branch(sandbox, &feature_branch)
            .await
            .context("Phase M4 (feature branch)")?;
        c.publisher
            .publish_progress(stream, "Project checked out", 25)
            .await;

        // M5: project context.
        let context = load_project_context(
            sandbox,
            &c.store,
            &mut tx,
            &c.config.cluster,
            project_id,
        )
        .await
        .context("Phase M5 (project context)")?;
        let existing_files: HashSet<String> = context.files.iter().cloned().collect();

        // M6: agent loop with the existing-endpoints prompt section.
        c.publisher
            .publish_progress(stream, "Applying your changes", 35)
            .await;
        let prompt_ctx = PromptContext {
            database: context.database.as_ref(),
            auth: None,
            payments: None,
            existing_endpoints: Some(&context.endpoints),
            handle_all_payment_events: false,
        };
        let system_prompt = build_system_prompt(&prompt_ctx);
        let outcome = run_agent_loop(
            c.agent_llm.as_ref(),
            sandbox,
            &system_prompt,
            request,
            &existing_files,
            c.config.max_agent_iterations,
        )
        .await
        .context("Phase M6 (agent session)")?;
        record_agent_cost(
            &c.ledger,
            &mut tx,
            &meta,
            c.agent_llm.model(),
            request,
            &outcome,
        )
        .await;
        if !outcome.success {
            return Err(PipelineError::Sandbox(format!(
                "agent did not complete within {} iterations",
                outcome.iterations
            )))
            .context("Phase M6 (agent session)");
        }
        c.publisher
            .publish_progress(stream, "Changes applied", 70)
            .await;

        // M7: apply deferred CREATE TABLE statements to the existing database.
        let create_tables: Vec<_> = outcome
            .db_queries
            .iter()
            .filter(|q| q.query_type.eq_ignore_ascii_case("CREATE TABLE"))
            .cloned()
            .collect();
        if !create_tables.is_empty() {
            let database = context
                .database
                .as_ref()
                .ok_or_else(|| {
                    PipelineError::Provisioning(
                        "agent emitted DDL but the project has no active database".to_string(),
                    )
                })
                .context("Phase M7 (schema update)")?;
            apply_agent_ddl(
                &c.config.cluster,
                &c.store,
                &c.ledger,
                &mut tx,
                project_id,
                user_id,
                &c.config.environment,
                &database.db_name,
                &create_tables,
            )
            .await
            .context("Phase M7 (schema update)")?;
        }

        // M8: land the change.
        let push = finish_modification(
            sandbox,
            c.github.owner(),
            &repo.repo_name,
            &feature_branch,
            request,
        )
        .await
        .context("Phase M8 (merge and push)")?;
        c.publisher
            .publish_progress(stream, "Changes pushed", 85)
            .await;

        // M9: refresh the stored blueprint when the agent touched it.
        let blueprint_touched = outcome
            .files_modified
            .iter()
            .any(|f| f.path == BLUEPRINT_PATH);
        let mut refreshed_blueprint = None;
        if blueprint_touched {
            let raw = sandbox
                .read_file(BLUEPRINT_PATH)
                .await
                .context("Phase M9 (blueprint read)")?;
            let content: serde_json::Value =
                serde_json::from_str(&raw).context("Phase M9 (blueprint parse)")?;
            if let Some(existing) = c
                .store
                .latest_api_blueprint(&mut tx, project_id)
                .await
                .context("Phase M9 (blueprint lookup)")?
            {
                c.store
                    .update_api_blueprint(
                        &mut tx,
                        &existing.blueprint_id,
                        &content,
                        epoch_seconds(),
                    )
                    .await
                    .context("Phase M9 (blueprint update)")?;
                c.ledger
                    .record_activity(
                        &mut tx,
                        NewActivity {
                            project_id,
                            user_id,
                            request_id: Some(&request_id),
                            action_type: crate::ledger::action::API_BLUEPRINT_UPDATED,
                            action_details: "Blueprint refreshed after modification".to_string(),
                            status: "success",
                            reference_ids: serde_json::json!({
                                "blueprint_id": existing.blueprint_id,
                            }),
                        },
                    )
                    .await;
            }
            refreshed_blueprint = Some(content);
        }

        // M10: activity rows.
        record_push(
            &c.store,
            &c.ledger,
            &mut tx,
            project_id,
            user_id,
            &c.config.environment,
            &push,
            request,
        )
        .await
        .context("Phase M10 (push history)")?;
        let change_kind = classify_modification(&outcome.files_modified);
        let routes = describe_routes(&outcome.files_modified);
        c.ledger
            .record_activity(
                &mut tx,
                NewActivity {
                    project_id,
                    user_id,
                    request_id: Some(&request_id),
                    action_type: change_kind,
                    action_details: if routes.is_empty() {
                        format!("{} files changed", outcome.files_modified.len())
                    } else {
                        routes.join(", ")
                    },
                    status: "success",
                    reference_ids: serde_json::json!({
                        "commit_sha": push.commit_sha,
                    }),
                },
            )
            .await;

        // M11: the merge to main re-triggers deployment through CI.
        c.publisher
            .publish_progress(stream, "Deployment re-triggered", 95)
            .await;

        // M12: finish.
        tx.commit().await.context("Phase M12 (commit)")?;
        self.finish_session(&session.session_id, SessionStatus::Completed)
            .await;

        if let Some(content) = refreshed_blueprint {
            c.publisher
                .publish_typed(stream, TypedMessage::ApiBlueprint { content })
                .await;
        }
        c.publisher
            .publish_typed(
                stream,
                TypedMessage::DeploymentTriggered {
                    url: crate::util::deployment_url_for(project_id),
                    status: "pending".to_string(),
                    message: "Deployment starts when CI completes the push to main".to_string(),
                },
            )
            .await;

        Ok(format!(
            "Project updated successfully!\n\n{}\n\nFiles modified: {}\nCommit: {}\n",
            outcome.summary.trim(),
            outcome.files_modified.len(),
            push.commit_sha
        ))
    }
}

#[async_trait]
impl JobProcessor for ModificationPipeline {
    fn job_name(&self) -> &str {
        JOB_MODIFICATION
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let payload: ModificationPayload = serde_json::from_value(job.payload.clone())
            .map_err(crate::errors::WorkerError::MalformedPayload)?;
        let stream_id = payload.stream_id.clone();

        let mut cleanup = Cleanup::default();
        let result = self.run(job, &payload, &mut cleanup).await;

        if let Some(sandbox) = cleanup.sandbox.take() {
            if let Err(e) = sandbox.stop().await {
                warn!(error = %e, "Sandbox teardown failed");
            }
        }

        match result {
            Ok(summary) => {
                self.ctx.publisher.publish_success(&stream_id, &summary).await;
                Ok(())
            }
            Err(e) => {
                if let Some(session_id) = cleanup.session_id.take() {
                    self.finish_session(&session_id, SessionStatus::Failed).await;
                }
                self.ctx
                    .publisher
                    .publish_error(&stream_id, &format!("{:#}", e))
                    .await;
                Err(e)
            }
        }
    }
}
