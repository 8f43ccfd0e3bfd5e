//! Activity ledger and cost accumulator.
//!
//! Both are append-only and both are ancillary: a failed write is logged and
//! swallowed, never propagated to the calling pipeline. Writes run inside a
//! savepoint on the caller's connection so a failed insert cannot poison the
//! job's outer transaction.

use anyhow::Result;
use sqlx::{Connection, PgConnection};
use tracing::warn;

use crate::db::models::{ActivityEntry, MessageCost};
use crate::db::Store;
use crate::util::{epoch_seconds, new_id, truncate};

/// Action vocabulary for the activity ledger.
pub mod action {
    pub const PROJECT_CREATED: &str = "project_created";
    pub const DATABASE_CREATED: &str = "database_created";
    pub const QUERIES_EXECUTED: &str = "queries_executed";
    pub const ENDPOINTS_ADDED: &str = "endpoints_added";
    pub const ENDPOINTS_MODIFIED: &str = "endpoints_modified";
    pub const TABLES_ADDED: &str = "tables_added";
    pub const BUSINESS_LOGIC_MODIFIED: &str = "business_logic_modified";
    pub const GITHUB_PUSH: &str = "github_push";
    pub const DEPLOYMENT: &str = "deployment";
    pub const ENV_VARS_REQUIRED: &str = "env_vars_required";
    pub const FLYIO_SECRET_SYNC: &str = "flyio-secret-sync";
    pub const API_BLUEPRINT_UPDATED: &str = "api_blueprint_updated";
}

/// Prompt snapshots stored on cost rows are truncated to this many chars.
const PROMPT_SNAPSHOT_MAX: usize = 500;

/// Per-million-token USD prices for a model family (matched by prefix).
struct ModelPrice {
    prefix: &'static str,
    input: f64,
    output: f64,
}

const PRICE_TABLE: &[ModelPrice] = &[
    ModelPrice {
        prefix: "claude-opus-4",
        input: 15.0,
        output: 75.0,
    },
    ModelPrice {
        prefix: "claude-sonnet-4",
        input: 3.0,
        output: 15.0,
    },
    ModelPrice {
        prefix: "claude-3-5-haiku",
        input: 0.80,
        output: 4.0,
    },
];

const DEFAULT_PRICE: ModelPrice = ModelPrice {
    prefix: "",
    input: 3.0,
    output: 15.0,
};

/// Dollar cost of a call. Unknown models degrade to the default price with a
/// warning rather than failing accounting.
pub fn cost_for(input_tokens: u64, output_tokens: u64, model: &str) -> f64 {
    let price = PRICE_TABLE
        .iter()
        .find(|p| model.starts_with(p.prefix))
        .unwrap_or_else(|| {
            warn!(model, "Unknown model in price table, using default pricing");
            &DEFAULT_PRICE
        });
    (input_tokens as f64 / 1_000_000.0) * price.input
        + (output_tokens as f64 / 1_000_000.0) * price.output
}

/// A new activity entry, before ids and timestamps are assigned.
pub struct NewActivity<'a> {
    pub project_id: &'a str,
    pub user_id: &'a str,
    pub request_id: Option<&'a str>,
    pub action_type: &'a str,
    pub action_details: String,
    pub status: &'a str,
    pub reference_ids: serde_json::Value,
}

/// A new cost entry for one model call or one aggregated agentic loop.
pub struct NewCost<'a> {
    pub project_id: &'a str,
    pub job_id: &'a str,
    pub user_id: &'a str,
    pub prompt_content: &'a str,
    pub message_type: &'a str,
    pub model: &'a str,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub time_to_completion_ms: i64,
    pub started_at: i64,
}

#[derive(Clone)]
pub struct Ledger {
    store: Store,
    environment: String,
}

impl Ledger {
    pub fn new(store: Store, environment: impl Into<String>) -> Self {
        Self {
            store,
            environment: environment.into(),
        }
    }

    /// Append one activity row. Never fails the caller: errors are logged
    /// and the savepoint is rolled back. Returns the action id when written.
    pub async fn record_activity(
        &self,
        conn: &mut PgConnection,
        activity: NewActivity<'_>,
    ) -> Option<String> {
        let entry = ActivityEntry {
            action_id: new_id(),
            project_id: activity.project_id.to_string(),
            user_id: activity.user_id.to_string(),
            request_id: activity.request_id.map(str::to_string),
            action_type: activity.action_type.to_string(),
            action_details: activity.action_details,
            status: activity.status.to_string(),
            environment: self.environment.clone(),
            reference_ids: activity.reference_ids,
            created_at: epoch_seconds(),
        };

        match self.try_insert_activity(conn, &entry).await {
            Ok(()) => Some(entry.action_id),
            Err(e) => {
                warn!(
                    action_type = %entry.action_type,
                    project_id = %entry.project_id,
                    error = %e,
                    "Activity write failed, continuing"
                );
                None
            }
        }
    }

    async fn try_insert_activity(
        &self,
        conn: &mut PgConnection,
        entry: &ActivityEntry,
    ) -> Result<()> {
        let mut savepoint = conn.begin().await?;
        self.store.insert_activity(&mut savepoint, entry).await?;
        savepoint.commit().await?;
        Ok(())
    }

    /// Append one cost row, pricing the tokens through the static table.
    /// Returns the computed USD cost (also when the write failed, so the
    /// caller's running total stays accurate).
    pub async fn record_cost(&self, conn: &mut PgConnection, cost: NewCost<'_>) -> f64 {
        let usd = cost_for(cost.input_tokens, cost.output_tokens, cost.model);
        let entry = MessageCost {
            cost_id: new_id(),
            project_id: cost.project_id.to_string(),
            job_id: cost.job_id.to_string(),
            user_id: cost.user_id.to_string(),
            prompt_content: truncate(cost.prompt_content, PROMPT_SNAPSHOT_MAX),
            message_type: cost.message_type.to_string(),
            model: cost.model.to_string(),
            input_tokens: cost.input_tokens as i64,
            output_tokens: cost.output_tokens as i64,
            cost_usd: usd,
            time_to_completion: cost.time_to_completion_ms,
            started_at: cost.started_at,
            created_at: epoch_seconds(),
        };

        if let Err(e) = self.try_insert_cost(conn, &entry).await {
            warn!(
                message_type = %entry.message_type,
                project_id = %entry.project_id,
                error = %e,
                "Cost write failed, continuing"
            );
        }
        usd
    }

    async fn try_insert_cost(&self, conn: &mut PgConnection, entry: &MessageCost) -> Result<()> {
        let mut savepoint = conn.begin().await?;
        self.store.insert_message_cost(&mut savepoint, entry).await?;
        savepoint.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_for_sonnet() {
        // 1M input + 1M output at $3/$15
        let usd = cost_for(1_000_000, 1_000_000, "claude-sonnet-4-20250514");
        assert!((usd - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_for_haiku() {
        let usd = cost_for(500_000, 250_000, "claude-3-5-haiku-20241022");
        assert!((usd - (0.40 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_cost_for_unknown_model_uses_default() {
        let usd = cost_for(1_000_000, 0, "totally-unknown-model");
        assert!((usd - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_for_zero_tokens() {
        assert_eq!(cost_for(0, 0, "claude-sonnet-4-20250514"), 0.0);
    }

    #[test]
    fn test_action_vocabulary_stability() {
        // These strings are part of the stored-record contract.
        assert_eq!(action::GITHUB_PUSH, "github_push");
        assert_eq!(action::FLYIO_SECRET_SYNC, "flyio-secret-sync");
        assert_eq!(action::ENV_VARS_REQUIRED, "env_vars_required");
    }
}
