//! Structured agent commands and their execution against the sandbox.
//!
//! Commands in a batch run in order; a failing command becomes a failed
//! result and does not abort the rest of the batch. `db_query` commands are
//! accepted and aggregated but never executed here — the pipeline applies
//! them after the loop.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::sandbox::Sandbox;
use crate::util::truncate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    Execute {
        command: String,
    },
    Write {
        path: String,
        content: String,
    },
    Read {
        path: String,
    },
    Delete {
        path: String,
    },
    DbQuery {
        query: String,
        #[serde(default, rename = "schemaName")]
        schema_name: String,
        #[serde(default, rename = "queryType")]
        query_type: String,
    },
}

impl AgentCommand {
    /// Short human-readable label used in result feedback to the agent.
    pub fn describe(&self) -> String {
        match self {
            Self::Execute { command } => format!("execute: {}", truncate(command, 120)),
            Self::Write { path, .. } => format!("write: {}", path),
            Self::Read { path } => format!("read: {}", path),
            Self::Delete { path } => format!("delete: {}", path),
            Self::DbQuery { query, .. } => format!("db_query: {}", truncate(query, 120)),
        }
    }
}

/// Static file-type rule over the written path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Route,
    Middleware,
    Model,
    Utility,
    Config,
    Other,
}

impl FileKind {
    pub fn classify(path: &str) -> Self {
        if path.contains("/api/") {
            Self::Route
        } else if path.contains("middleware") {
            Self::Middleware
        } else if path.contains("model") {
            Self::Model
        } else if path.contains("util") {
            Self::Utility
        } else if path.contains("config") {
            Self::Config
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifiedFile {
    pub path: String,
    pub kind: FileKind,
    pub is_new: bool,
}

/// A deferred DDL statement collected from a `db_query` command.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredQuery {
    pub query: String,
    pub schema_name: String,
    pub query_type: String,
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

/// Outcome of one command batch.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub results: Vec<CommandResult>,
    pub files_modified: Vec<ModifiedFile>,
    pub db_queries: Vec<DeferredQuery>,
}

/// Execute a batch of agent commands. Each command is attempted
/// independently; a failure is reported in its slot and the batch continues.
pub async fn execute_commands(
    sandbox: &dyn Sandbox,
    commands: &[AgentCommand],
    existing_files: &HashSet<String>,
) -> ExecutionReport {
    let mut report = ExecutionReport::default();

    for command in commands {
        let label = command.describe();
        let outcome: anyhow::Result<String> = match command {
            AgentCommand::Execute { command } => sandbox.exec(command).await.map(|out| {
                if out.success() {
                    out.stdout
                } else {
                    format!(
                        "exit {}: {}{}",
                        out.exit_code,
                        out.stdout,
                        out.stderr
                    )
                }
            }),
            AgentCommand::Write { path, content } => {
                let result = sandbox.write_file(path, content).await;
                if result.is_ok() {
                    report.files_modified.push(ModifiedFile {
                        path: path.clone(),
                        kind: FileKind::classify(path),
                        is_new: !existing_files.contains(path),
                    });
                }
                result.map(|_| format!("wrote {} bytes", content.len()))
            }
            AgentCommand::Read { path } => sandbox.read_file(path).await,
            AgentCommand::Delete { path } => {
                sandbox.delete_file(path).await.map(|_| "deleted".to_string())
            }
            AgentCommand::DbQuery {
                query,
                schema_name,
                query_type,
            } => {
                report.db_queries.push(DeferredQuery {
                    query: query.clone(),
                    schema_name: schema_name.clone(),
                    query_type: query_type.clone(),
                });
                Ok("queued for execution after the session".to_string())
            }
        };

        match outcome {
            Ok(output) => report.results.push(CommandResult {
                command: label,
                success: true,
                output,
                error: None,
            }),
            Err(e) => report.results.push(CommandResult {
                command: label,
                success: false,
                output: String::new(),
                error: Some(format!("{:#}", e)),
            }),
        }
    }

    report
}
