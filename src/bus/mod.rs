//! Publish/subscribe publisher.
//!
//! One shared `Publisher` bound to the bus with its own connection, distinct
//! from the queue's. Before any publish, a ready barrier is awaited; it is
//! resolved by the first successful `PING` on the dedicated connection.
//!
//! Publishing is fire-and-forget: failures are logged and never throttle or
//! fail the pipeline. Every pipeline execution path must still produce
//! exactly one terminal message (`complete=true`) on the job's stream id —
//! that discipline lives in the pipeline orchestrator, not here.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::util::epoch_millis;

/// Structured non-terminal artifact messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TypedMessage {
    #[serde(rename = "apiBlueprint")]
    ApiBlueprint { content: serde_json::Value },
    #[serde(rename = "deployment_triggered")]
    DeploymentTriggered {
        url: String,
        status: String,
        message: String,
    },
    #[serde(rename = "deployment_complete")]
    DeploymentComplete {
        url: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Full message taxonomy on a job's stream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamMessage {
    Typed(TypedMessage),
    Progress { message: String, progress: u8 },
    Terminal {
        complete: bool,
        content: String,
        #[serde(rename = "isError")]
        is_error: bool,
    },
}

impl StreamMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { complete: true, .. })
    }
}

/// Seam over the underlying bus so tests can capture traffic in memory.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
}

/// Redis-backed bus on a dedicated connection with the ready barrier.
pub struct RedisBus {
    conn: redis::aio::ConnectionManager,
    ready: watch::Receiver<bool>,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        let (ready_tx, ready_rx) = watch::channel(false);

        // Resolve the ready barrier on the first successful PING.
        let mut probe = conn.clone();
        tokio::spawn(async move {
            loop {
                let pong: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut probe).await;
                match pong {
                    Ok(_) => {
                        let _ = ready_tx.send(true);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Bus ping failed, retrying");
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                }
            }
        });

        Ok(Self {
            conn,
            ready: ready_rx,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|connected| *connected)
            .await
            .map_err(|_| anyhow::anyhow!("Bus ready barrier dropped"))?;

        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// The shared publisher. Cloneable; all clones share the bus connection.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn Bus>,
}

impl Publisher {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    async fn send(&self, channel: &str, message: &StreamMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to serialize stream message");
                return;
            }
        };
        if let Err(e) = self.bus.publish(channel, &payload).await {
            warn!(channel, error = %e, "Publish failed");
        } else {
            debug!(channel, "Published stream message");
        }
    }

    /// Non-terminal progress update. `progress` is clamped to [0, 100].
    pub async fn publish_progress(&self, stream_id: &str, message: &str, progress: u8) {
        self.send(
            stream_id,
            &StreamMessage::Progress {
                message: message.to_string(),
                progress: progress.min(100),
            },
        )
        .await;
    }

    /// Terminal success. Exactly one terminal message per job.
    pub async fn publish_success(&self, stream_id: &str, content: &str) {
        self.send(
            stream_id,
            &StreamMessage::Terminal {
                complete: true,
                content: content.to_string(),
                is_error: false,
            },
        )
        .await;
    }

    /// Terminal failure.
    pub async fn publish_error(&self, stream_id: &str, content: &str) {
        self.send(
            stream_id,
            &StreamMessage::Terminal {
                complete: true,
                content: content.to_string(),
                is_error: true,
            },
        )
        .await;
    }

    /// Structured non-terminal message (blueprint, deployment events).
    pub async fn publish_typed(&self, stream_id: &str, message: TypedMessage) {
        self.send(stream_id, &StreamMessage::Typed(message)).await;
    }

    /// Streaming LLM relay: one chunk on the job's dedicated channel.
    pub async fn publish_llm_chunk(&self, job_id: &str, chunk: &str) {
        let payload = serde_json::json!({
            "jobId": job_id,
            "chunk": chunk,
            "done": false,
            "timestamp": epoch_millis(),
        });
        if let Err(e) = self
            .bus
            .publish(&format!("llm-stream-{}", job_id), &payload.to_string())
            .await
        {
            warn!(job_id, error = %e, "LLM chunk publish failed");
        }
    }

    /// Streaming LLM relay: completion marker, with the error when one occurred.
    pub async fn publish_llm_done(&self, job_id: &str, error: Option<&str>) {
        let mut payload = serde_json::json!({
            "jobId": job_id,
            "done": true,
            "timestamp": epoch_millis(),
        });
        if let Some(err) = error {
            payload["error"] = serde_json::Value::String(err.to_string());
        }
        if let Err(e) = self
            .bus
            .publish(&format!("llm-stream-{}", job_id), &payload.to_string())
            .await
        {
            warn!(job_id, error = %e, "LLM done publish failed");
        }
    }
}

/// In-memory bus double recording every publish, for tests.
#[derive(Default)]
pub struct MemoryBus {
    messages: std::sync::Mutex<Vec<(String, String)>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    /// Messages published on one channel, decoded.
    pub fn on_channel(&self, channel: &str) -> Vec<StreamMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .filter_map(|(_, p)| serde_json::from_str(p).ok())
            .collect()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_message_shape() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::new(bus.clone());
        publisher.publish_progress("s1", "Setting up", 25).await;

        let raw = bus.messages();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].0, "s1");
        let value: serde_json::Value = serde_json::from_str(&raw[0].1).unwrap();
        assert_eq!(value["message"], "Setting up");
        assert_eq!(value["progress"], 25);
    }

    #[tokio::test]
    async fn test_progress_clamped_to_hundred() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::new(bus.clone());
        publisher.publish_progress("s1", "done-ish", 140).await;
        let value: serde_json::Value = serde_json::from_str(&bus.messages()[0].1).unwrap();
        assert_eq!(value["progress"], 100);
    }

    #[tokio::test]
    async fn test_terminal_success_shape() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::new(bus.clone());
        publisher.publish_success("s1", "Project created successfully").await;

        let value: serde_json::Value = serde_json::from_str(&bus.messages()[0].1).unwrap();
        assert_eq!(value["complete"], true);
        assert_eq!(value["isError"], false);
        assert_eq!(value["content"], "Project created successfully");
    }

    #[tokio::test]
    async fn test_terminal_error_shape() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::new(bus.clone());
        publisher.publish_error("s1", "Phase P2: sandbox died").await;

        let messages = bus.on_channel("s1");
        assert!(messages[0].is_terminal());
        match &messages[0] {
            StreamMessage::Terminal { is_error, .. } => assert!(*is_error),
            other => panic!("expected terminal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typed_blueprint_shape() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::new(bus.clone());
        publisher
            .publish_typed(
                "s1",
                TypedMessage::ApiBlueprint {
                    content: serde_json::json!({"endpoints": []}),
                },
            )
            .await;

        let value: serde_json::Value = serde_json::from_str(&bus.messages()[0].1).unwrap();
        assert_eq!(value["type"], "apiBlueprint");
        assert!(value["content"]["endpoints"].is_array());
    }

    #[tokio::test]
    async fn test_llm_chunk_channel_and_shape() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::new(bus.clone());
        publisher.publish_llm_chunk("job42", "hello").await;
        publisher.publish_llm_done("job42", None).await;

        let raw = bus.messages();
        assert_eq!(raw[0].0, "llm-stream-job42");
        let chunk: serde_json::Value = serde_json::from_str(&raw[0].1).unwrap();
        assert_eq!(chunk["chunk"], "hello");
        assert_eq!(chunk["done"], false);
        let done: serde_json::Value = serde_json::from_str(&raw[1].1).unwrap();
        assert_eq!(done["done"], true);
        assert!(done.get("error").is_none());
    }

    #[test]
    fn test_terminal_detection() {
        let terminal = StreamMessage::Terminal {
            complete: true,
            content: "ok".into(),
            is_error: false,
        };
        assert!(terminal.is_terminal());
        let progress = StreamMessage::Progress {
            message: "working".into(),
            progress: 10,
        };
        assert!(!progress.is_terminal());
    }
}
