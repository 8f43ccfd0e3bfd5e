//! Typed error hierarchy for the worker.
//!
//! Three top-level enums cover the three subsystems:
//! - `WorkerError` — startup, configuration, and queue-runtime failures
//! - `PipelineError` — per-job pipeline failures (creation / modification / secret-sync)
//! - `AgentError` — agentic-loop protocol and execution failures

use thiserror::Error;

/// Errors from the worker runtime: configuration, queue, and dispatch.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Unknown job name: {0}")]
    UnknownJob(String),

    #[error("Malformed job payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single pipeline execution. The variant message is what gets
/// published on the job's stream, prefixed by the failing phase.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No GitHub repository found for this project")]
    MissingRepository,

    #[error("No deployment found for this project")]
    MissingDeployment,

    #[error("Database provisioning failed: {0}")]
    Provisioning(String),

    #[error("Sandbox operation failed: {0}")]
    Sandbox(String),

    #[error("Deployment platform error: {0}")]
    Deployment(String),

    #[error("Source host error: {0}")]
    SourceHost(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the agentic loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent did not complete within {iterations} iterations")]
    IterationCapReached { iterations: u32 },

    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("Agent emitted unparseable JSON after recovery: {0}")]
    Protocol(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
