//! Crate-level tests for the worker's cross-module invariants, exercised
//! through the public API over the in-memory doubles.

use std::collections::HashSet;
use std::sync::Arc;

use turbobackend_worker::agent::commands::{AgentCommand, FileKind};
use turbobackend_worker::agent::prompt::{build_system_prompt, PromptContext};
use turbobackend_worker::agent::run_agent_loop;
use turbobackend_worker::bus::{Bus, MemoryBus, Publisher, StreamMessage};
use turbobackend_worker::ledger::cost_for;
use turbobackend_worker::llm::ScriptedLlm;
use turbobackend_worker::pipeline::context::endpoint_from_path;
use turbobackend_worker::sandbox::{MemorySandbox, Sandbox};
use turbobackend_worker::util::{app_name_for, database_name_for, deployment_url_for};

// ---------------------------------------------------------------------
// Name determinism (the worker's external contracts)
// ---------------------------------------------------------------------

#[test]
fn derived_names_are_deterministic_slugs() {
    assert_eq!(database_name_for("p2"), "turbobackend_proj_p2");
    assert_eq!(
        database_name_for("My-Project-1"),
        "turbobackend_proj_my_project_1"
    );
    assert_eq!(app_name_for("p1"), "turbobackend-p1");
    assert_eq!(deployment_url_for("p1"), "https://turbobackend-p1.fly.dev");
}

// ---------------------------------------------------------------------
// Publisher ordering: progress values are non-decreasing up to terminal
// ---------------------------------------------------------------------

#[tokio::test]
async fn progress_sequence_is_non_decreasing_up_to_terminal() {
    let bus = Arc::new(MemoryBus::new());
    let publisher = Publisher::new(bus.clone());

    for (message, pct) in [
        ("Analyzing your request", 5),
        ("Database ready", 20),
        ("Building your API", 35),
        ("API built", 70),
        ("Code pushed", 90),
    ] {
        publisher.publish_progress("s1", message, pct).await;
    }
    publisher.publish_success("s1", "Project created successfully!").await;

    let messages = bus.on_channel("s1");
    let mut last = 0u8;
    let mut terminal_count = 0;
    for message in &messages {
        match message {
            StreamMessage::Progress { progress, .. } => {
                assert!(*progress >= last, "progress regressed: {} < {}", progress, last);
                last = *progress;
            }
            StreamMessage::Terminal { complete, .. } => {
                assert!(*complete);
                terminal_count += 1;
            }
            StreamMessage::Typed(_) => {}
        }
    }
    assert_eq!(terminal_count, 1);
    assert!(matches!(messages.last().unwrap(), StreamMessage::Terminal { .. }));
}

// ---------------------------------------------------------------------
// Agent loop: JSON recovery (bad iteration, then success)
// ---------------------------------------------------------------------

#[tokio::test]
async fn agent_loop_survives_invalid_json_iteration() {
    let llm = ScriptedLlm::new("claude-sonnet-4-20250514");
    // Iteration 1: raw newline embedded in a JSON string value.
    llm.push_text(
        "{\"reasoning\": \"writing\", \"commands\": [{\"type\": \"write\", \"path\": \"server/api/notes/index.get.js\", \"content\": \"line one\nline two\"}], \"taskComplete\": false, \"summary\": \"\"}",
    );
    // Iteration 2: valid completion.
    llm.push_text(
        r#"{"reasoning": "done", "commands": [], "taskComplete": true,
           "summary": "notes API ready", "apiBlueprint": {"endpoints": []}}"#,
    );

    let sandbox = MemorySandbox::new();
    let outcome = run_agent_loop(&llm, &sandbox, "system", "build notes", &HashSet::new(), 25)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.files_modified.len(), 1);
    assert_eq!(outcome.files_modified[0].kind, FileKind::Route);
    // The file content survived sanitation with the newline intact.
    assert_eq!(
        sandbox
            .read_file("server/api/notes/index.get.js")
            .await
            .unwrap(),
        "line one\nline two"
    );
    // Aggregated cost covers both iterations at the loop model's pricing.
    let expected = cost_for(2000, 1000, "claude-sonnet-4-20250514");
    assert!((outcome.total_cost - expected).abs() < 1e-12);
}

// ---------------------------------------------------------------------
// Command ordering with failures (batch keeps going)
// ---------------------------------------------------------------------

#[tokio::test]
async fn command_batch_reports_failures_in_place() {
    use turbobackend_worker::agent::commands::execute_commands;

    let sandbox = MemorySandbox::new();
    let commands = vec![
        AgentCommand::Write {
            path: "a.js".into(),
            content: "1".into(),
        },
        AgentCommand::Read {
            path: "does-not-exist.js".into(),
        },
        AgentCommand::Write {
            path: "b.js".into(),
            content: "2".into(),
        },
    ];

    let report = execute_commands(&sandbox, &commands, &HashSet::new()).await;
    let flags: Vec<bool> = report.results.iter().map(|r| r.success).collect();
    assert_eq!(flags, vec![true, false, true]);
}

// ---------------------------------------------------------------------
// Modification prompt lists discovered endpoints
// ---------------------------------------------------------------------

#[test]
fn modification_prompt_contains_endpoint_lines() {
    let endpoints: Vec<_> = [
        "server/api/users/index.get.js",
        "server/api/users/index.post.js",
    ]
    .iter()
    .filter_map(|p| endpoint_from_path(p))
    .collect();

    let ctx = PromptContext {
        existing_endpoints: Some(&endpoints),
        ..Default::default()
    };
    let prompt = build_system_prompt(&ctx);
    assert!(prompt.contains("- GET /api/users (server/api/users/index.get.js)"));
    assert!(prompt.contains("- POST /api/users (server/api/users/index.post.js)"));
}

// ---------------------------------------------------------------------
// LLM relay channels
// ---------------------------------------------------------------------

#[tokio::test]
async fn llm_relay_uses_dedicated_channel_per_job() {
    let bus = Arc::new(MemoryBus::new());
    let publisher = Publisher::new(bus.clone());

    publisher.publish_llm_chunk("job-7", "partial").await;
    publisher.publish_llm_done("job-7", None).await;
    publisher.publish_llm_done("job-8", Some("provider timeout")).await;

    let raw = bus.messages();
    assert_eq!(raw[0].0, "llm-stream-job-7");
    assert_eq!(raw[2].0, "llm-stream-job-8");
    let failed: serde_json::Value = serde_json::from_str(&raw[2].1).unwrap();
    assert_eq!(failed["error"], "provider timeout");
    assert_eq!(failed["done"], true);
}

// ---------------------------------------------------------------------
// Bus double sanity: publish goes through the trait seam
// ---------------------------------------------------------------------

#[tokio::test]
async fn memory_bus_is_a_bus() {
    let bus = MemoryBus::new();
    bus.publish("c", "{}").await.unwrap();
    assert_eq!(bus.messages().len(), 1);
}
