//! The agentic loop.
//!
//! A bounded iteration of agent-call, command-execute, result-feedback until
//! the agent declares completion. Strictly sequential: iteration k's
//! commands finish before iteration k+1's LLM call is made, and commands
//! within an iteration run in declared order.

pub mod commands;
pub mod integrations;
pub mod parser;
pub mod prompt;

use std::collections::HashSet;

use anyhow::Result;
use sqlx::PgConnection;
use tracing::{info, warn};

use crate::detectors::CostMeta;
use crate::errors::AgentError;
use crate::ledger::{cost_for, Ledger, NewCost};
use crate::llm::{LlmClient, Usage};
use crate::sandbox::Sandbox;
use crate::util::{epoch_millis, epoch_seconds};

use commands::{execute_commands, CommandResult, DeferredQuery, ModifiedFile};
use parser::{parse_agent_response, ParseStatus, REEMIT_JSON_PROMPT};

/// Cost rows for the aggregated loop carry this message type.
pub const AGENT_MESSAGE_TYPE: &str = "agentic-container-execution";

#[derive(Debug)]
pub struct AgentOutcome {
    /// True iff the loop terminated via `taskComplete`.
    pub success: bool,
    pub iterations: u32,
    pub files_modified: Vec<ModifiedFile>,
    pub db_queries: Vec<DeferredQuery>,
    pub summary: String,
    pub api_blueprint: Option<serde_json::Value>,
    pub usage: Usage,
    pub total_cost: f64,
    pub started_at: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Role {
    User,
    Assistant,
}

struct Turn {
    role: Role,
    content: String,
}

/// Serialize the running conversation into a single prompt payload for the
/// non-streaming LLM.
fn render_conversation(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns {
        let label = match turn.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        out.push_str(&format!("{}:\n{}\n\n", label, turn.content));
    }
    out.push_str("Assistant:\n");
    out
}

fn render_results(results: &[CommandResult]) -> String {
    let mut out = String::from("Command results:\n");
    for (index, result) in results.iter().enumerate() {
        let status = if result.success { "ok" } else { "failed" };
        out.push_str(&format!("{}. [{}] {}\n", index + 1, status, result.command));
        if let Some(error) = &result.error {
            out.push_str(&format!("   error: {}\n", error));
        } else if !result.output.trim().is_empty() {
            out.push_str(&format!(
                "   {}\n",
                crate::util::truncate(result.output.trim(), 2000)
            ));
        }
    }
    out.push_str(
        "\nContinue building. When the API is complete, set taskComplete to true and include \
         the apiBlueprint.",
    );
    out
}

/// Deduplicate modified files by path: the first write decides `is_new`.
fn merge_modified(into: &mut Vec<ModifiedFile>, seen: &mut HashSet<String>, batch: Vec<ModifiedFile>) {
    for file in batch {
        if seen.insert(file.path.clone()) {
            into.push(file);
        }
    }
}

/// Drive the agent to convergence inside the sandbox.
///
/// `max_iterations` must be finite; the loop terminates with
/// `success = false` when the cap is reached without `taskComplete`.
pub async fn run_agent_loop(
    llm: &dyn LlmClient,
    sandbox: &dyn Sandbox,
    system_prompt: &str,
    user_request: &str,
    existing_files: &HashSet<String>,
    max_iterations: u32,
) -> Result<AgentOutcome> {
    let started_at = epoch_seconds();
    let started_ms = epoch_millis();

    let mut turns = vec![Turn {
        role: Role::User,
        content: user_request.to_string(),
    }];
    let mut usage = Usage::default();
    let mut files_modified: Vec<ModifiedFile> = Vec::new();
    let mut seen_paths: HashSet<String> = HashSet::new();
    let mut db_queries: Vec<DeferredQuery> = Vec::new();
    let mut summary = String::new();
    let mut api_blueprint = None;
    let mut success = false;
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;

        let payload = render_conversation(&turns);
        let generation = llm
            .generate(&payload, Some(system_prompt))
            .await
            .map_err(|e| AgentError::Provider(format!("{:#}", e)))?;
        usage.input_tokens += generation.usage.input_tokens;
        usage.output_tokens += generation.usage.output_tokens;

        let (response, status) = parse_agent_response(&generation.text);
        turns.push(Turn {
            role: Role::Assistant,
            content: generation.text,
        });

        if status == ParseStatus::Fallback {
            warn!(iteration = iterations, "Agent emitted invalid JSON, requesting re-emit");
            turns.push(Turn {
                role: Role::User,
                content: REEMIT_JSON_PROMPT.to_string(),
            });
            continue;
        }

        let report = execute_commands(sandbox, &response.commands, existing_files).await;
        merge_modified(&mut files_modified, &mut seen_paths, report.files_modified);
        db_queries.extend(report.db_queries);

        turns.push(Turn {
            role: Role::User,
            content: render_results(&report.results),
        });

        if response.task_complete {
            summary = response.summary;
            api_blueprint = response.api_blueprint;
            success = true;
            break;
        }
        if !response.summary.is_empty() {
            summary = response.summary;
        }
    }

    let total_cost = cost_for(usage.input_tokens, usage.output_tokens, llm.model());
    info!(
        iterations,
        success,
        files = files_modified.len(),
        cost_usd = total_cost,
        "Agent loop finished"
    );

    Ok(AgentOutcome {
        success,
        iterations,
        files_modified,
        db_queries,
        summary,
        api_blueprint,
        usage,
        total_cost,
        started_at,
        duration_ms: epoch_millis() - started_ms,
    })
}

/// Record the single aggregated cost entry for one loop invocation.
pub async fn record_agent_cost(
    ledger: &Ledger,
    conn: &mut PgConnection,
    meta: &CostMeta,
    model: &str,
    user_request: &str,
    outcome: &AgentOutcome,
) -> f64 {
    ledger
        .record_cost(
            conn,
            NewCost {
                project_id: &meta.project_id,
                job_id: &meta.job_id,
                user_id: &meta.user_id,
                prompt_content: user_request,
                message_type: AGENT_MESSAGE_TYPE,
                model,
                input_tokens: outcome.usage.input_tokens,
                output_tokens: outcome.usage.output_tokens,
                time_to_completion_ms: outcome.duration_ms,
                started_at: outcome.started_at,
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::sandbox::MemorySandbox;

    fn complete_response(summary: &str) -> String {
        format!(
            r#"{{"reasoning": "done", "commands": [], "taskComplete": true, "summary": "{}",
               "apiBlueprint": {{"endpoints": []}}}}"#,
            summary
        )
    }

    #[tokio::test]
    async fn test_loop_completes_on_task_complete() {
        let llm = ScriptedLlm::new("claude-sonnet-4-20250514");
        llm.push_text(
            r#"{"reasoning": "write route", "commands": [
                {"type": "write", "path": "server/api/hello.get.js", "content": "x"}
            ], "taskComplete": false, "summary": ""}"#,
        );
        llm.push_text(&complete_response("built hello API"));

        let sandbox = MemorySandbox::new();
        let outcome = run_agent_loop(&llm, &sandbox, "system", "build hello", &HashSet::new(), 25)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.files_modified.len(), 1);
        assert_eq!(outcome.summary, "built hello API");
        assert!(outcome.api_blueprint.is_some());
        // Usage accumulated across both iterations of the scripted double.
        assert_eq!(outcome.usage.input_tokens, 2000);
        assert_eq!(outcome.usage.output_tokens, 1000);
    }

    #[tokio::test]
    async fn test_loop_recovers_from_raw_newline_then_completes() {
        let llm = ScriptedLlm::new("claude-sonnet-4-20250514");
        // Iteration 1: raw newline inside a string value — recoverable by
        // sanitation, so its command still executes.
        llm.push_text(
            "{\"reasoning\": \"r\", \"commands\": [{\"type\": \"write\", \"path\": \"a.js\", \"content\": \"l1\nl2\"}], \"taskComplete\": false, \"summary\": \"\"}",
        );
        llm.push_text(&complete_response("done"));

        let sandbox = MemorySandbox::new();
        let outcome = run_agent_loop(&llm, &sandbox, "system", "go", &HashSet::new(), 25)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(
            sandbox.read_file("a.js").await.unwrap(),
            "l1\nl2"
        );
    }

    #[tokio::test]
    async fn test_loop_injects_corrective_turn_on_garbage() {
        let llm = ScriptedLlm::new("claude-sonnet-4-20250514");
        llm.push_text("I will start by thinking about the problem.");
        llm.push_text(&complete_response("recovered"));

        let sandbox = MemorySandbox::new();
        let outcome = run_agent_loop(&llm, &sandbox, "system", "go", &HashSet::new(), 25)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.iterations, 2);
        // The second call's prompt must contain the corrective user turn.
        let calls = llm.calls();
        assert!(calls[1].0.contains("not valid JSON"));
    }

    #[tokio::test]
    async fn test_loop_stops_at_iteration_cap() {
        let llm = ScriptedLlm::new("claude-sonnet-4-20250514");
        for _ in 0..3 {
            llm.push_text(
                r#"{"reasoning": "still going", "commands": [], "taskComplete": false, "summary": ""}"#,
            );
        }

        let sandbox = MemorySandbox::new();
        let outcome = run_agent_loop(&llm, &sandbox, "system", "go", &HashSet::new(), 3)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn test_loop_defers_db_queries() {
        let llm = ScriptedLlm::new("claude-sonnet-4-20250514");
        llm.push_text(
            r#"{"reasoning": "new table", "commands": [
                {"type": "db_query", "query": "CREATE TABLE tags (id VARCHAR(32))", "schemaName": "tags", "queryType": "CREATE TABLE"}
            ], "taskComplete": true, "summary": "ok"}"#,
        );

        let sandbox = MemorySandbox::new();
        let outcome = run_agent_loop(&llm, &sandbox, "system", "go", &HashSet::new(), 25)
            .await
            .unwrap();

        assert_eq!(outcome.db_queries.len(), 1);
        assert_eq!(outcome.db_queries[0].query_type, "CREATE TABLE");
        assert!(sandbox.execs().is_empty());
    }

    #[tokio::test]
    async fn test_feedback_turn_carries_command_results() {
        let llm = ScriptedLlm::new("claude-sonnet-4-20250514");
        llm.push_text(
            r#"{"reasoning": "r", "commands": [{"type": "read", "path": "present.js"}], "taskComplete": false, "summary": ""}"#,
        );
        llm.push_text(&complete_response("done"));

        let sandbox = MemorySandbox::new().with_file("present.js", "content-42");
        run_agent_loop(&llm, &sandbox, "system", "go", &HashSet::new(), 25)
            .await
            .unwrap();

        let calls = llm.calls();
        assert!(calls[1].0.contains("Command results:"));
        assert!(calls[1].0.contains("content-42"));
        assert!(calls[1].0.contains("taskComplete"));
    }

    #[tokio::test]
    async fn test_first_write_decides_is_new() {
        let llm = ScriptedLlm::new("claude-sonnet-4-20250514");
        llm.push_text(
            r#"{"reasoning": "r", "commands": [
                {"type": "write", "path": "server/api/a.get.js", "content": "v1"},
                {"type": "write", "path": "server/api/a.get.js", "content": "v2"}
            ], "taskComplete": true, "summary": "ok"}"#,
        );

        let sandbox = MemorySandbox::new();
        let outcome = run_agent_loop(&llm, &sandbox, "system", "go", &HashSet::new(), 25)
            .await
            .unwrap();

        assert_eq!(outcome.files_modified.len(), 1);
        assert!(outcome.files_modified[0].is_new);
    }
}
