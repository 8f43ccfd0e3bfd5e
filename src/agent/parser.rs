//! Agent protocol parsing and recovery.
//!
//! Every iteration the model must answer with one JSON document. Models
//! occasionally emit raw control characters inside string values; those are
//! sanitized and the document reparsed. If that still fails, a fallback
//! response is synthesized so the loop can ask the model to re-emit valid
//! JSON instead of crashing.

use serde::{Deserialize, Serialize};

use super::commands::AgentCommand;
use crate::util::{extract_json_object, truncate};

/// Required response shape, every iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub commands: Vec<AgentCommand>,
    pub task_complete: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub api_blueprint: Option<serde_json::Value>,
}

/// How the response was obtained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParseStatus {
    /// Parsed directly.
    Clean,
    /// Parsed after control-character sanitation.
    Sanitized,
    /// Unparseable; a fallback response was synthesized and the loop should
    /// append a corrective user turn.
    Fallback,
}

/// Escape raw control characters inside JSON string values. Characters
/// outside string literals are left alone.
pub fn sanitize_control_chars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in raw.chars() {
        if in_string {
            if escaped {
                out.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' => {
                    out.push(ch);
                    escaped = true;
                }
                '"' => {
                    out.push(ch);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => {
                    out.push_str(&format!("\\u{:04x}", c as u32));
                }
                c => out.push(c),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

/// Parse the model's text into an `AgentResponse`, recovering where possible.
pub fn parse_agent_response(text: &str) -> (AgentResponse, ParseStatus) {
    let candidate = extract_json_object(text).unwrap_or_else(|| text.to_string());

    if let Ok(response) = serde_json::from_str::<AgentResponse>(&candidate) {
        return (response, ParseStatus::Clean);
    }

    let sanitized = sanitize_control_chars(&candidate);
    if let Ok(response) = serde_json::from_str::<AgentResponse>(&sanitized) {
        return (response, ParseStatus::Sanitized);
    }

    let fallback = AgentResponse {
        reasoning: format!(
            "Response was not valid JSON: {}",
            truncate(text.trim(), 200)
        ),
        commands: Vec::new(),
        task_complete: false,
        summary: String::new(),
        api_blueprint: None,
    };
    (fallback, ParseStatus::Fallback)
}

/// Corrective user turn appended after a fallback.
pub const REEMIT_JSON_PROMPT: &str = "Your previous response was not valid JSON. Re-emit your \
    answer as a single JSON document with the keys reasoning, commands, taskComplete, summary \
    (and apiBlueprint when taskComplete is true). Do not wrap it in markdown.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_response() {
        let text = r#"{
            "reasoning": "set up the route",
            "commands": [{"type": "write", "path": "server/api/a.get.js", "content": "x"}],
            "taskComplete": false,
            "summary": ""
        }"#;
        let (response, status) = parse_agent_response(text);
        assert_eq!(status, ParseStatus::Clean);
        assert_eq!(response.commands.len(), 1);
        assert!(!response.task_complete);
    }

    #[test]
    fn test_parse_with_markdown_fence() {
        let text = "Here you go:\n```json\n{\"reasoning\": \"done\", \"commands\": [], \"taskComplete\": true, \"summary\": \"built it\"}\n```";
        let (response, status) = parse_agent_response(text);
        assert_eq!(status, ParseStatus::Clean);
        assert!(response.task_complete);
        assert_eq!(response.summary, "built it");
    }

    #[test]
    fn test_parse_recovers_raw_newline_in_string() {
        // Raw newline inside the "content" string value: invalid JSON until
        // sanitized.
        let text = "{\"reasoning\": \"r\", \"commands\": [{\"type\": \"write\", \"path\": \"a.js\", \"content\": \"line one\nline two\"}], \"taskComplete\": false, \"summary\": \"\"}";
        let (response, status) = parse_agent_response(text);
        assert_eq!(status, ParseStatus::Sanitized);
        match &response.commands[0] {
            AgentCommand::Write { content, .. } => {
                assert_eq!(content, "line one\nline two");
            }
            other => panic!("expected write, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_fallback_on_garbage() {
        let (response, status) = parse_agent_response("I couldn't decide what to do next.");
        assert_eq!(status, ParseStatus::Fallback);
        assert!(!response.task_complete);
        assert!(response.commands.is_empty());
        assert!(response.reasoning.contains("not valid JSON"));
    }

    #[test]
    fn test_parse_fallback_on_unclosed_object() {
        let (_, status) = parse_agent_response(r#"{"reasoning": "partial"#);
        assert_eq!(status, ParseStatus::Fallback);
    }

    #[test]
    fn test_sanitize_leaves_valid_escapes_alone() {
        let raw = r#"{"a": "already\nescaped"}"#;
        assert_eq!(sanitize_control_chars(raw), raw);
    }

    #[test]
    fn test_sanitize_handles_tab_and_cr() {
        let raw = "{\"a\": \"x\ty\r\"}";
        assert_eq!(sanitize_control_chars(raw), r#"{"a": "x\ty\r"}"#);
    }

    #[test]
    fn test_sanitize_ignores_control_chars_outside_strings() {
        let raw = "{\n  \"a\": 1\n}";
        assert_eq!(sanitize_control_chars(raw), raw);
    }

    #[test]
    fn test_blueprint_passthrough() {
        let text = r#"{"reasoning": "done", "commands": [], "taskComplete": true,
            "summary": "ok", "apiBlueprint": {"endpoints": [{"method": "GET", "path": "/api/health"}]}}"#;
        let (response, _) = parse_agent_response(text);
        let blueprint = response.api_blueprint.unwrap();
        assert_eq!(blueprint["endpoints"][0]["method"], "GET");
    }
}
