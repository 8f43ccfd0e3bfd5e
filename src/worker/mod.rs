//! Dispatcher and worker runtime.
//!
//! Consumes the durable queue, routes jobs by name to registered
//! processors, bounds concurrency with a semaphore, renews each in-flight
//! job's lease, and shuts down in order: stop consuming, drain in-flight up
//! to a deadline, then (outside production) wipe pending jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::errors::WorkerError;
use crate::queue::{DeliveredJob, Job, RedisQueue};

#[async_trait]
pub trait JobProcessor: Send + Sync {
    fn job_name(&self) -> &str;
    async fn process(&self, job: &Job) -> Result<()>;
}

/// Routes job names to their processors.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn JobProcessor>) {
        self.processors
            .insert(processor.job_name().to_string(), processor);
    }

    pub fn get(&self, job_name: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(job_name).cloned()
    }
}

/// How long shutdown waits for in-flight jobs.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

pub struct WorkerRuntime {
    queue: Arc<RedisQueue>,
    registry: ProcessorRegistry,
    concurrency: usize,
    wipe_on_shutdown: bool,
}

impl WorkerRuntime {
    pub fn new(
        queue: Arc<RedisQueue>,
        registry: ProcessorRegistry,
        concurrency: usize,
        wipe_on_shutdown: bool,
    ) -> Self {
        Self {
            queue,
            registry,
            concurrency: concurrency.max(1),
            wipe_on_shutdown,
        }
    }

    /// Consume until the shutdown signal flips, then drain and close.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        info!(concurrency = self.concurrency, "Worker consuming");

        while !*shutdown.borrow() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let delivered = tokio::select! {
                delivered = self.queue.next_job() => delivered,
                _ = shutdown.changed() => {
                    drop(permit);
                    break;
                }
            };

            match delivered {
                Ok(Some(delivered)) => {
                    let queue = self.queue.clone();
                    let processor = self.registry.get(&delivered.job.name);
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_job(queue, processor, delivered).await;
                    });
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Queue poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        // Drain: wait for every permit to return, bounded by the deadline.
        info!("Worker draining in-flight jobs");
        let drained = tokio::time::timeout(DRAIN_DEADLINE, async {
            let _ = semaphore.acquire_many(self.concurrency as u32).await;
        })
        .await;
        if drained.is_err() {
            warn!("Drain deadline reached with jobs still in flight");
        }

        if self.wipe_on_shutdown {
            if let Err(e) = self.queue.obliterate().await {
                warn!(error = %e, "Queue wipe failed");
            }
        }
        info!("Worker stopped");
        Ok(())
    }
}

/// Run one job to a terminal queue state, renewing its lease while the
/// processor works.
async fn handle_job(
    queue: Arc<RedisQueue>,
    processor: Option<Arc<dyn JobProcessor>>,
    delivered: DeliveredJob,
) {
    let job = delivered.job.clone();
    info!(job_id = %job.id, name = %job.name, attempt = job.attempt, "Job started");

    let renewal = {
        let queue = queue.clone();
        let job_id = job.id.clone();
        let interval = Duration::from_millis(queue.config().renew_interval_ms() as u64);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = queue.renew_lease(&job_id).await {
                    warn!(job_id = %job_id, error = %e, "Lease renewal failed");
                }
            }
        })
    };

    let result = match processor {
        Some(processor) => processor.process(&job).await,
        None => Err(WorkerError::UnknownJob(job.name.clone()).into()),
    };

    renewal.abort();

    match result {
        Ok(()) => {
            if let Err(e) = queue.complete(&delivered).await {
                error!(job_id = %job.id, error = %e, "Failed to ack completed job");
            }
        }
        Err(e) => {
            let reason = format!("{:#}", e);
            error!(job_id = %job.id, name = %job.name, reason = %reason, "Job failed");
            if let Err(e) = queue.fail(&delivered, &reason).await {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProcessor {
        name: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobProcessor for FakeProcessor {
        fn job_name(&self) -> &str {
            self.name
        }

        async fn process(&self, _job: &Job) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_registry_routes_by_name() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(FakeProcessor {
            name: "initialProjectCreationJob",
            calls: AtomicUsize::new(0),
        }));
        registry.register(Arc::new(FakeProcessor {
            name: "projectModificationJob",
            calls: AtomicUsize::new(0),
        }));

        assert!(registry.get("initialProjectCreationJob").is_some());
        assert!(registry.get("projectModificationJob").is_some());
        assert!(registry.get("bogusJob").is_none());
    }

    #[test]
    fn test_registry_latest_registration_wins() {
        let mut registry = ProcessorRegistry::new();
        let first = Arc::new(FakeProcessor {
            name: "initialProjectCreationJob",
            calls: AtomicUsize::new(0),
        });
        let second = Arc::new(FakeProcessor {
            name: "initialProjectCreationJob",
            calls: AtomicUsize::new(0),
        });
        registry.register(first);
        let second_dyn: Arc<dyn JobProcessor> = second;
        registry.register(second_dyn.clone());

        let resolved = registry.get("initialProjectCreationJob").unwrap();
        assert!(Arc::ptr_eq(&resolved, &second_dyn));
    }

    #[tokio::test]
    async fn test_fake_processor_counts_calls() {
        let processor = FakeProcessor {
            name: "x",
            calls: AtomicUsize::new(0),
        };
        let job = Job {
            id: "j".into(),
            name: "x".into(),
            attempt: 1,
            payload: serde_json::Value::Null,
            enqueued_at: 0,
        };
        processor.process(&job).await.unwrap();
        processor.process(&job).await.unwrap();
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_job_error_is_descriptive() {
        let err: anyhow::Error = WorkerError::UnknownJob("mysteryJob".into()).into();
        assert!(format!("{:#}", err).contains("Unknown job name: mysteryJob"));
    }
}
