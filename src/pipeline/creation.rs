//! Creation pipeline: the phased state machine that turns a natural-language
//! request into a deployed project.
//!
//! Every control-database write for the job happens on one outer
//! transaction; the terminal success message is only published after that
//! transaction commits. External side effects (repository, cluster database,
//! sandbox) are not rolled back on failure; the create paths are idempotent
//! so a retried job converges.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::agent::integrations::IntegrationPack;
use crate::agent::prompt::{build_system_prompt, PromptContext};
use crate::agent::{record_agent_cost, run_agent_loop};
use crate::bus::TypedMessage;
use crate::config::WorkerConfig;
use crate::db::models::{
    ApiBlueprint, ContainerSession, CredentialPlaceholder, Deployment, DeploymentStatus,
    GithubRepo, RequestLog, SessionStatus,
};
use crate::deploy::{database_secret_pairs, install_flyctl, set_secrets};
use crate::detectors::{detect, CostMeta, DetectorKind};
use crate::errors::PipelineError;
use crate::github::git::{initial_push, subsequent_push, DEFAULT_BRANCH};
use crate::github::inject::{inject_deploy_files, DEPLOY_SECRET_NAME};
use crate::github::record_push;
use crate::ledger::{action, NewActivity};
use crate::queue::{Job, JOB_CREATION};
use crate::sandbox::project::{initialize_project, sync_to_object_store, ProjectInit};
use crate::sandbox::Sandbox;
use crate::schema::{design_schema, provision_database, DatabaseInfo};
use crate::util::{
    app_name_for, deployment_url_for, epoch_seconds, new_id, repo_name_for,
};
use crate::worker::JobProcessor;

use super::{describe_routes, CreationPayload, WorkerContext};

/// Blueprint keys the worker strips before persisting or publishing.
const DISALLOWED_BLUEPRINT_KEYS: &[&str] = &["projectId", "projectName", "version", "database"];

pub fn strip_blueprint(mut blueprint: serde_json::Value) -> serde_json::Value {
    if let Some(map) = blueprint.as_object_mut() {
        for key in DISALLOWED_BLUEPRINT_KEYS {
            map.remove(*key);
        }
    }
    blueprint
}

/// Environment handed to a fresh sandbox: object-store credentials for the
/// mirror CLI.
pub fn sandbox_env(config: &WorkerConfig) -> Vec<(String, String)> {
    vec![
        (
            "AWS_ACCESS_KEY_ID".to_string(),
            config.object_store.access_key_id.clone(),
        ),
        (
            "AWS_SECRET_ACCESS_KEY".to_string(),
            config.object_store.secret_access_key.clone(),
        ),
        (
            "AWS_DEFAULT_REGION".to_string(),
            config.object_store.region.clone(),
        ),
    ]
}

/// Terminal success text. The substrings here are a front-end contract.
#[allow(clippy::too_many_arguments)]
fn build_success_message(
    summary: &str,
    files_modified: usize,
    database: Option<&DatabaseInfo>,
    total_cost: f64,
    project_id: &str,
    auth_needed: bool,
    payment_needed: bool,
) -> String {
    let mut out = String::from("Project created successfully!\n");
    if !summary.is_empty() {
        out.push_str(&format!("\n{}\n", summary.trim()));
    }
    out.push_str(&format!("\nFiles modified: {}\n", files_modified));
    if let Some(db) = database {
        out.push_str(&format!(
            "Database: {} ({} tables)\n",
            db.db_name,
            db.schema.tables.len()
        ));
    }
    out.push_str(&format!("Cost: ${:.4}\n", total_cost));
    out.push_str(&format!("Deploying to: {}\n", deployment_url_for(project_id)));
    if auth_needed {
        out.push_str(
            "\n⚠️  CLERK keys required: set CLERK_SECRET_KEY, CLERK_PUBLISHABLE_KEY and \
             CLERK_WEBHOOK_SECRET before the auth endpoints will work.\n",
        );
    }
    if payment_needed {
        out.push_str(
            "\n⚠️  STRIPE keys required: set STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET \
             before the payment endpoints will work.\n",
        );
    }
    out
}

/// Credential placeholder variables per detected integration.
fn placeholder_variables(auth: bool, payment: bool) -> Vec<(&'static str, &'static str)> {
    let mut variables = Vec::new();
    if auth {
        variables.push(("clerk", "CLERK_SECRET_KEY"));
        variables.push(("clerk", "CLERK_PUBLISHABLE_KEY"));
        variables.push(("clerk", "CLERK_WEBHOOK_SECRET"));
    }
    if payment {
        variables.push(("stripe", "STRIPE_SECRET_KEY"));
        variables.push(("stripe", "STRIPE_WEBHOOK_SECRET"));
    }
    variables
}

#[derive(Default)]
struct Cleanup {
    sandbox: Option<Box<dyn Sandbox>>,
    session_id: Option<String>,
}

pub struct CreationPipeline {
    ctx: Arc<WorkerContext>,
}

impl CreationPipeline {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    async fn record_session(&self, project_id: &str, container_id: &str) -> Result<String> {
        let session = ContainerSession {
            session_id: new_id(),
            project_id: project_id.to_string(),
            container_id: container_id.to_string(),
            provider: self.ctx.sandboxes.name().to_string(),
            status: SessionStatus::Active,
            environment: self.ctx.config.environment.clone(),
            started_at: epoch_seconds(),
            stopped_at: None,
        };
        let mut conn = self.ctx.pool.acquire().await?;
        self.ctx
            .store
            .insert_container_session(&mut conn, &session)
            .await?;
        Ok(session.session_id)
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
        payload: &CreationPayload,
        cleanup: &mut Cleanup,
    ) -> Result<String> {
        let c = &self.ctx;
        let stream = &payload.stream_id;
        let project_id = &payload.project_id;
        let user_id = &payload.user_id;
        let user_prompt = &payload.request_params.user_prompt;
        let request_id = payload
            .request_id
            .clone()
            .unwrap_or_else(new_id);
        let meta = CostMeta {
            project_id: project_id.clone(),
            job_id: job.id.clone(),
            user_id: user_id.clone(),
        };
        let mut total_cost = 0.0;

        let mut tx = c
            .pool
            .begin()
            .await
            .context("Phase P0 (setup): control database unavailable")?;

        c.store
            .insert_request_log(
                &mut tx,
                &RequestLog {
                    request_id: request_id.clone(),
                    project_id: project_id.clone(),
                    user_id: user_id.clone(),
                    intent: JOB_CREATION.to_string(),
                    request_params: serde_json::json!({"userPrompt": user_prompt}),
                    status: "processing".to_string(),
                    created_at: epoch_seconds(),
                },
            )
            .await
            .context("Phase P0 (setup)")?;

        // P0: intent detection.
        c.publisher
            .publish_progress(stream, "Analyzing your request", 5)
            .await;
        let (auth, cost) = detect(
            c.detector_llm.as_ref(),
            &c.ledger,
            &mut tx,
            &meta,
            DetectorKind::Auth,
            user_prompt,
        )
        .await;
        total_cost += cost;
        c.publisher
            .publish_progress(stream, "Checked authentication needs", 7)
            .await;
        let (payment, cost) = detect(
            c.detector_llm.as_ref(),
            &c.ledger,
            &mut tx,
            &meta,
            DetectorKind::Payment,
            user_prompt,
        )
        .await;
        total_cost += cost;
        c.publisher
            .publish_progress(stream, "Checked payment needs", 9)
            .await;
        let (database, cost) = detect(
            c.detector_llm.as_ref(),
            &c.ledger,
            &mut tx,
            &meta,
            DetectorKind::Database,
            user_prompt,
        )
        .await;
        total_cost += cost;
        c.publisher
            .publish_progress(stream, "Checked database needs", 12)
            .await;

        // P1: schema design and provisioning.
        let database_info = if database.needed {
            c.publisher
                .publish_progress(stream, "Designing your database schema", 15)
                .await;
            let (schema, cost) = design_schema(
                c.detector_llm.as_ref(),
                &c.ledger,
                &mut tx,
                &meta,
                user_prompt,
            )
            .await
            .context("Phase P1 (schema design)")?;
            total_cost += cost;
            let info = provision_database(
                &c.config.cluster,
                &c.store,
                &c.ledger,
                &mut tx,
                project_id,
                user_id,
                &c.config.environment,
                schema,
            )
            .await
            .context("Phase P1 (database provisioning)")?;
            c.publisher
                .publish_progress(stream, "Database ready", 20)
                .await;
            Some(info)
        } else {
            None
        };

        // P2: sandbox and project skeleton.
        c.publisher
            .publish_progress(stream, "Provisioning a build sandbox", 25)
            .await;
        let sandbox = c
            .sandboxes
            .provision(project_id, &sandbox_env(&c.config))
            .await
            .context("Phase P2 (sandbox provisioning)")?;
        let session_id = self
            .record_session(project_id, sandbox.id())
            .await
            .context("Phase P2 (session record)")?;
        cleanup.session_id = Some(session_id.clone());
        cleanup.sandbox = Some(sandbox);
        let sandbox: &dyn Sandbox = cleanup.sandbox.as_deref().unwrap();

        let project_env = c.config.project_env();
        initialize_project(
            sandbox,
            &ProjectInit {
                project_id,
                database: database_info.as_ref(),
                auth_needed: auth.needed,
                payment_needed: payment.needed,
                extra_env: &project_env,
            },
        )
        .await
        .context("Phase P2 (project initialization)")?;
        c.publisher
            .publish_progress(stream, "Project skeleton ready", 30)
            .await;
        c.ledger
            .record_activity(
                &mut tx,
                NewActivity {
                    project_id,
                    user_id,
                    request_id: Some(&request_id),
                    action_type: action::PROJECT_CREATED,
                    action_details: format!("Initialized project for: {}", user_prompt),
                    status: "success",
                    reference_ids: serde_json::json!({
                        "container_session_id": session_id,
                    }),
                },
            )
            .await;

        // P3: integration docs.
        let auth_pack: Option<Arc<IntegrationPack>> = if auth.needed {
            Some(
                c.integrations
                    .load("clerk")
                    .context("Phase P3 (integration docs)")?,
            )
        } else {
            None
        };
        let payment_pack: Option<Arc<IntegrationPack>> = if payment.needed {
            Some(
                c.integrations
                    .load("stripe")
                    .context("Phase P3 (integration docs)")?,
            )
        } else {
            None
        };

        // P4: the agentic loop.
        c.publisher
            .publish_progress(stream, "Building your API", 35)
            .await;
        let prompt_ctx = PromptContext {
            database: database_info.as_ref(),
            auth: auth_pack.as_deref(),
            payments: payment_pack.as_deref(),
            existing_endpoints: None,
            handle_all_payment_events: false,
        };
        let system_prompt = build_system_prompt(&prompt_ctx);
        let outcome = run_agent_loop(
            c.agent_llm.as_ref(),
            sandbox,
            &system_prompt,
            user_prompt,
            &HashSet::new(),
            c.config.max_agent_iterations,
        )
        .await
        .context("Phase P4 (agent session)")?;
        total_cost += record_agent_cost(
            &c.ledger,
            &mut tx,
            &meta,
            c.agent_llm.model(),
            user_prompt,
            &outcome,
        )
        .await;
        if !outcome.success {
            return Err(PipelineError::Sandbox(format!(
                "agent did not complete within {} iterations",
                outcome.iterations
            )))
            .context("Phase P4 (agent session)");
        }
        c.publisher.publish_progress(stream, "API built", 70).await;

        // P5: injections and deployment preparation.
        let app_name = app_name_for(project_id);
        inject_deploy_files(sandbox, &app_name)
            .await
            .context("Phase P5 (deployment files)")?;
        c.fly
            .ensure_app(&app_name)
            .await
            .context("Phase P5 (app creation)")?;
        if let Some(db) = &database_info {
            install_flyctl(sandbox)
                .await
                .context("Phase P5 (platform CLI)")?;
            set_secrets(
                sandbox,
                &c.config.fly_api_token,
                &app_name,
                &database_secret_pairs(db),
            )
            .await
            .context("Phase P5 (app secrets)")?;
        }
        let now = epoch_seconds();
        c.store
            .insert_deployment(
                &mut tx,
                &Deployment {
                    deployment_id: new_id(),
                    project_id: project_id.clone(),
                    platform: "fly.io".to_string(),
                    app_name: app_name.clone(),
                    url: deployment_url_for(project_id),
                    status: DeploymentStatus::Pending,
                    deployed_at: now,
                    last_updated: now,
                },
            )
            .await
            .context("Phase P5 (deployment record)")?;
        let routes = describe_routes(&outcome.files_modified);
        if !routes.is_empty() {
            c.ledger
                .record_activity(
                    &mut tx,
                    NewActivity {
                        project_id,
                        user_id,
                        request_id: Some(&request_id),
                        action_type: action::ENDPOINTS_ADDED,
                        action_details: routes.join(", "),
                        status: "success",
                        reference_ids: serde_json::json!({}),
                    },
                )
                .await;
        }
        c.publisher
            .publish_progress(stream, "Deployment prepared", 80)
            .await;

        // P6: push and mirror.
        let repo_name = repo_name_for(project_id);
        let repo = c
            .github
            .ensure_repo(&repo_name)
            .await
            .context("Phase P6 (repository)")?;
        let push = initial_push(sandbox, &c.config.github_token, c.github.owner(), &repo_name)
            .await
            .context("Phase P6 (push)")?;
        c.store
            .insert_github_repo(
                &mut tx,
                &GithubRepo {
                    repo_id: new_id(),
                    project_id: project_id.clone(),
                    user_id: user_id.clone(),
                    repo_url: repo.html_url.clone(),
                    repo_name: repo_name.clone(),
                    branch: DEFAULT_BRANCH.to_string(),
                    is_active: true,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await
            .context("Phase P6 (repository record)")?;
        record_push(
            &c.store,
            &c.ledger,
            &mut tx,
            project_id,
            user_id,
            &c.config.environment,
            &push,
            "Initial TurboBackend project",
        )
        .await
        .context("Phase P6 (push history)")?;
        c.github
            .put_actions_secret(&repo_name, DEPLOY_SECRET_NAME, &c.config.fly_api_token)
            .await
            .context("Phase P6 (repository secret)")?;
        sync_to_object_store(sandbox, &c.config.object_store, project_id, user_id)
            .await
            .context("Phase P6 (object store mirror)")?;
        c.publisher
            .publish_progress(stream, "Code pushed", 90)
            .await;

        // P7: blueprint.
        let blueprint = outcome.api_blueprint.clone().map(strip_blueprint);
        if let Some(content) = &blueprint {
            sandbox
                .write_file(
                    "api-blueprint.json",
                    &serde_json::to_string_pretty(content)?,
                )
                .await
                .context("Phase P7 (blueprint file)")?;
            let blueprint_push =
                subsequent_push(sandbox, c.github.owner(), &repo_name, "Add API blueprint")
                    .await
                    .context("Phase P7 (blueprint push)")?;
            record_push(
                &c.store,
                &c.ledger,
                &mut tx,
                project_id,
                user_id,
                &c.config.environment,
                &blueprint_push,
                "Add API blueprint",
            )
            .await
            .context("Phase P7 (blueprint push history)")?;
            c.store
                .insert_api_blueprint(
                    &mut tx,
                    &ApiBlueprint {
                        blueprint_id: new_id(),
                        project_id: project_id.clone(),
                        request_id: request_id.clone(),
                        blueprint_content: content.clone(),
                        last_updated: epoch_seconds(),
                        created_at: epoch_seconds(),
                    },
                )
                .await
                .context("Phase P7 (blueprint record)")?;
            c.publisher
                .publish_progress(stream, "API blueprint stored", 95)
                .await;
        }

        // P8: credential placeholders.
        let variables = placeholder_variables(auth.needed, payment.needed);
        if !variables.is_empty() {
            for (provider, variable) in &variables {
                c.store
                    .insert_credential_placeholder(
                        &mut tx,
                        &CredentialPlaceholder {
                            credential_id: new_id(),
                            project_id: project_id.clone(),
                            provider: provider.to_string(),
                            variable_name: variable.to_string(),
                            value: None,
                            is_active: true,
                            created_at: epoch_seconds(),
                            updated_at: epoch_seconds(),
                        },
                    )
                    .await
                    .context("Phase P8 (credential placeholders)")?;
            }
            let names: Vec<&str> = variables.iter().map(|(_, v)| *v).collect();
            c.ledger
                .record_activity(
                    &mut tx,
                    NewActivity {
                        project_id,
                        user_id,
                        request_id: Some(&request_id),
                        action_type: action::ENV_VARS_REQUIRED,
                        action_details: format!("User must supply: {}", names.join(", ")),
                        status: "pending",
                        reference_ids: serde_json::json!({"variables": names}),
                    },
                )
                .await;
        }

        tx.commit().await.context("Phase P9 (commit)")?;

        if let Some(session_id) = &cleanup.session_id {
            self.finish_session(session_id, SessionStatus::Completed).await;
        }

        // Intermediate artifacts go out after the commit, before the
        // terminal message.
        if let Some(content) = blueprint {
            c.publisher
                .publish_typed(stream, TypedMessage::ApiBlueprint { content })
                .await;
        }
        c.publisher
            .publish_typed(
                stream,
                TypedMessage::DeploymentTriggered {
                    url: deployment_url_for(project_id),
                    status: "pending".to_string(),
                    message: "Deployment starts when CI completes the push to main".to_string(),
                },
            )
            .await;

        Ok(build_success_message(
            &outcome.summary,
            outcome.files_modified.len(),
            database_info.as_ref(),
            total_cost,
            project_id,
            auth.needed,
            payment.needed,
        ))
    }
}

#[async_trait]
impl JobProcessor for CreationPipeline {
    fn job_name(&self) -> &str {
        JOB_CREATION
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let payload: CreationPayload = serde_json::from_value(job.payload.clone())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DesignedColumn, DesignedSchema, DesignedTable};

    fn db_info(tables: usize) -> DatabaseInfo {
        DatabaseInfo {
            database_id: "db1".into(),
            db_name: "turbobackend_proj_p2".into(),
            host: "h".into(),
            port: 5432,
            user: "u".into(),
            password: "p".into(),
            schema: DesignedSchema {
                tables: (0..tables)
                    .map(|i| DesignedTable {
                        table_name: format!("t{}", i),
                        columns: vec![DesignedColumn {
                            name: "id".into(),
                            col_type: "VARCHAR(32)".into(),
                            constraints: "PRIMARY KEY".into(),
                        }],
                        create_query: format!("CREATE TABLE t{} (id VARCHAR(32))", i),
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn test_success_message_minimal_creation() {
        let message = build_success_message("built it", 3, None, 0.1234, "p1", false, false);
        assert!(message.contains("Project created successfully"));
        assert!(message.contains("Files modified: 3"));
        assert!(message.contains("Cost: $0.1234"));
        assert!(message.contains("Deploying to: https://turbobackend-p1.fly.dev"));
        assert!(!message.contains("Database:"));
        assert!(!message.contains("⚠️"));
    }

    #[test]
    fn test_success_message_with_database() {
        let db = db_info(2);
        let message = build_success_message("", 5, Some(&db), 0.5, "p2", false, false);
        assert!(message.contains("Database: turbobackend_proj_p2 (2 tables)"));
    }

    #[test]
    fn test_success_message_with_auth_warning() {
        let message = build_success_message("", 1, None, 0.2, "p3", true, false);
        assert!(message.contains("⚠️  CLERK"));
        assert!(message.contains("CLERK_WEBHOOK_SECRET"));
        assert!(!message.contains("STRIPE"));
    }

    #[test]
    fn test_success_message_with_payment_warning() {
        let message = build_success_message("", 1, None, 0.2, "p3", false, true);
        assert!(message.contains("⚠️  STRIPE"));
    }

    #[test]
    fn test_strip_blueprint_removes_disallowed_keys() {
        let blueprint = serde_json::json!({
            "projectId": "p1",
            "projectName": "demo",
            "version": "1.0",
            "database": {"tables": []},
            "endpoints": [{"method": "GET", "path": "/api/health"}],
        });
        let stripped = strip_blueprint(blueprint);
        assert!(stripped.get("projectId").is_none());
        assert!(stripped.get("projectName").is_none());
        assert!(stripped.get("version").is_none());
        assert!(stripped.get("database").is_none());
        assert!(stripped.get("endpoints").is_some());
    }

    #[test]
    fn test_placeholder_variables() {
        assert!(placeholder_variables(false, false).is_empty());
        let auth_only = placeholder_variables(true, false);
        assert_eq!(auth_only.len(), 3);
        assert!(auth_only.iter().all(|(p, _)| *p == "clerk"));
        let both = placeholder_variables(true, true);
        assert_eq!(both.len(), 5);
    }

    #[test]
    fn test_sandbox_env_carries_object_store_credentials() {
        let config = crate::config::WorkerConfig {
            redis_url: String::new(),
            database_url: String::new(),
            db_schema: "turbobackend".into(),
            cluster: crate::config::ClusterConfig {
                host: String::new(),
                port: 5432,
                user: String::new(),
                password: String::new(),
            },
            object_store: crate::config::ObjectStoreConfig {
                bucket: "b".into(),
                region: "us-east-1".into(),
                access_key_id: "AKIA".into(),
                secret_access_key: "shh".into(),
            },
            anthropic_api_key: String::new(),
            agent_model: String::new(),
            detector_model: String::new(),
            github_token: String::new(),
            github_owner: String::new(),
            fly_api_token: String::new(),
            fly_org: String::new(),
            sandbox_image: String::new(),
            integrations_dir: std::path::PathBuf::new(),
            concurrency: 5,
            max_agent_iterations: 25,
            environment: "test".into(),
        };
        let env = sandbox_env(&config);
        assert!(env.contains(&("AWS_ACCESS_KEY_ID".to_string(), "AKIA".to_string())));
        assert_eq!(env.len(), 3);
    }
}
