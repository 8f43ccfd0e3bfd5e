//! Intent detectors.
//!
//! Three tiny LLM-driven classifiers over the user's natural-language
//! request: does the project need a database, authentication, payments.
//! Each is a single non-streaming call with a JSON-only system prompt. Any
//! failure — provider error, unparseable response — degrades to the safe
//! default (`needed = false`) so a flaky classifier can never fail a job.

use sqlx::PgConnection;
use tracing::warn;

use crate::ledger::{Ledger, NewCost};
use crate::llm::LlmClient;
use crate::util::{epoch_millis, epoch_seconds, extract_json_object};

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub needed: bool,
    pub reasoning: String,
}

impl Detection {
    fn failed() -> Self {
        Self {
            needed: false,
            reasoning: "detection failed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectorKind {
    Database,
    Auth,
    Payment,
}

impl DetectorKind {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Database => "database-detection",
            Self::Auth => "auth-detection",
            Self::Payment => "payment-detection",
        }
    }

    fn system_prompt(&self) -> &'static str {
        match self {
            Self::Database => {
                "You are a classifier. Decide whether the described HTTP API needs \
                 persistent storage in a relational database. Respond with JSON only, \
                 no markdown, exactly: {\"needed\": true|false, \"reasoning\": \"one sentence\"}. \
                 Data that must survive between requests (users, posts, records, orders) \
                 means needed=true. Pure passthrough or stateless computation means needed=false."
            }
            Self::Auth => {
                "You are a classifier. Decide whether the described HTTP API needs user \
                 authentication (login, signup, sessions, protected routes, per-user data). \
                 Respond with JSON only, no markdown, exactly: \
                 {\"needed\": true|false, \"reasoning\": \"one sentence\"}."
            }
            Self::Payment => {
                "You are a classifier. Decide whether the described HTTP API needs payment \
                 processing (checkout, subscriptions, one-time charges, billing). \
                 Respond with JSON only, no markdown, exactly: \
                 {\"needed\": true|false, \"reasoning\": \"one sentence\"}."
            }
        }
    }
}

/// Identifies the job a cost entry is accounted under.
#[derive(Debug, Clone)]
pub struct CostMeta {
    pub project_id: String,
    pub job_id: String,
    pub user_id: String,
}

fn parse_detection(text: &str) -> Option<Detection> {
    let json = extract_json_object(text)?;
    let value: serde_json::Value = serde_json::from_str(&json).ok()?;
    Some(Detection {
        needed: value.get("needed")?.as_bool()?,
        reasoning: value
            .get("reasoning")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string(),
    })
}

/// Run one classifier. Accrues one cost entry per call; the returned f64 is
/// that call's USD cost (zero when the call itself failed).
pub async fn detect(
    llm: &dyn LlmClient,
    ledger: &Ledger,
    conn: &mut PgConnection,
    meta: &CostMeta,
    kind: DetectorKind,
    user_request: &str,
) -> (Detection, f64) {
    let started_at = epoch_seconds();
    let started_ms = epoch_millis();

    let generation = match llm.generate(user_request, Some(kind.system_prompt())).await {
        Ok(generation) => generation,
        Err(e) => {
            warn!(kind = kind.message_type(), error = %e, "Detector LLM call failed");
            return (Detection::failed(), 0.0);
        }
    };

    let cost = ledger
        .record_cost(
            conn,
            NewCost {
                project_id: &meta.project_id,
                job_id: &meta.job_id,
                user_id: &meta.user_id,
                prompt_content: user_request,
                message_type: kind.message_type(),
                model: llm.model(),
                input_tokens: generation.usage.input_tokens,
                output_tokens: generation.usage.output_tokens,
                time_to_completion_ms: epoch_millis() - started_ms,
                started_at,
            },
        )
        .await;

    let detection = match parse_detection(&generation.text) {
        Some(detection) => detection,
        None => {
            warn!(
                kind = kind.message_type(),
                response = %crate::util::truncate(&generation.text, 200),
                "Detector returned unparseable response"
            );
            Detection::failed()
        }
    };
    (detection, cost)
}
