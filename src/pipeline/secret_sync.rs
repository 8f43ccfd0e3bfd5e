//! Secret-sync processor: enqueued when a user supplies a real credential
//! value for one of the placeholder variables. Provisions a one-shot
//! sandbox, installs the platform CLI, sets the single named secret on the
//! app, and tears the sandbox down regardless of outcome.
//!
//! No outer transaction here: the activity row must record failure as well
//! as success, so writes go through plain pooled connections.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::deploy::{install_flyctl, set_secrets};
use crate::errors::PipelineError;
use crate::ledger::{action, NewActivity};
use crate::queue::{Job, JOB_SECRET_SYNC};
use crate::util::app_name_for;
use crate::worker::JobProcessor;

use super::creation::sandbox_env;
use super::{SecretSyncPayload, WorkerContext};

pub struct SecretSyncProcessor {
    ctx: Arc<WorkerContext>,
}

impl SecretSyncProcessor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    async fn run(&self, payload: &SecretSyncPayload) -> Result<()> {
        let c = &self.ctx;
        let project_id = &payload.project_id;
        let secret_name = &payload.request_params.secret_name;

        // The project must have been deployed before secrets can be synced.
        {
            let mut conn = c.pool.acquire().await.context("Secret sync (setup)")?;
            c.store
                .latest_deployment(&mut conn, project_id)
                .await
                .context("Secret sync (deployment lookup)")?
                .ok_or(PipelineError::MissingDeployment)
                .context("Secret sync (deployment lookup)")?;
        }

        c.publisher
            .publish_progress(&payload.stream_id, "Syncing your credential", 20)
            .await;

        let sandbox = c
            .sandboxes
            .provision(project_id, &sandbox_env(&c.config))
            .await
            .context("Secret sync (sandbox)")?;

        let result = async {
            install_flyctl(sandbox.as_ref())
                .await
                .context("Secret sync (platform CLI)")?;
            set_secrets(
                sandbox.as_ref(),
                &c.config.fly_api_token,
                &app_name_for(project_id),
                &[(
                    secret_name.clone(),
                    payload.request_params.secret_value.clone(),
                )],
            )
            .await
            .context("Secret sync (secret installation)")
        }
        .await;

        // Teardown happens whatever the outcome.
        if let Err(e) = sandbox.stop().await {
            warn!(error = %e, "Secret-sync sandbox teardown failed");
        }

        let mut conn = c.pool.acquire().await.context("Secret sync (activity)")?;
        c.ledger
            .record_activity(
                &mut conn,
                NewActivity {
                    project_id,
                    user_id: &payload.user_id,
                    request_id: payload.request_id.as_deref(),
                    action_type: action::FLYIO_SECRET_SYNC,
                    action_details: match &result {
                        Ok(()) => format!("Synced secret {}", secret_name),
                        Err(e) => format!("Failed to sync secret {}: {:#}", secret_name, e),
                    },
                    status: if result.is_ok() { "success" } else { "failed" },
                    reference_ids: serde_json::json!({"secret_name": secret_name}),
                },
            )
            .await;

        result
    }
}

#[async_trait]
impl JobProcessor for SecretSyncProcessor {
    fn job_name(&self) -> &str {
        JOB_SECRET_SYNC
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let payload: SecretSyncPayload = serde_json::from_value(job.payload.clone())
            .map_err(crate::errors::WorkerError::MalformedPayload)?;
        let stream_id = payload.stream_id.clone();
        let secret_name = payload.request_params.secret_name.clone();

        match self.run(&payload).await {
            Ok(()) => {
                self.ctx
                    .publisher
                    .publish_success(&stream_id, &format!("Secret {} synced", secret_name))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .publisher
                    .publish_error(&stream_id, &format!("{:#}", e))
                    .await;
                Err(e)
            }
        }
    }
}
