/// Job queue and worker pool
///
/// `JobQueue::enqueue` never blocks: jobs go onto an unbounded channel and a
/// fixed pool of workers drains it. Delivery is at-least-once: a job whose
/// processor fails (or panics) is redelivered with exponential backoff until
/// `max_attempts` is reached. Every outcome is broadcast as a [`JobEvent`].

use crate::config::QueueConfig;
use crate::error::EngineError;
use crate::runtime::engine::{Continuation, ExecutionRequest};
use crate::store::InboundPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Payload of a `webhook` job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJob {
    pub webhook_id: Uuid,
    pub request_id: Uuid,
    pub payload: InboundPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Direct or scheduled run
    Execute(ExecutionRequest),
    /// Inbound trigger captured by webhook ingestion
    Webhook(WebhookJob),
    /// A suspended or freshly spawned execution branch
    Continue(Continuation),
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Execute(_) => "execute",
            JobKind::Webhook(_) => "webhook",
            JobKind::Continue(_) => "continue",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable across redeliveries
    pub id: Uuid,
    /// What to do; also the payload
    pub kind: JobKind,
    /// Deliveries so far, including the current one
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed,
    Failed { error: String, will_retry: bool },
}

/// Completion/failure notification, for observability and tests
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub kind: &'static str,
    pub attempt: u32,
    pub outcome: JobOutcome,
}

/// Something that can act on a job; implemented by the engine-backed worker
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> anyhow::Result<()>;

    /// Called once after the final failed delivery of `job`
    async fn abandon(&self, _job: &Job, _error: &str) {}
}

/// Cloneable producer side of the queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    events: broadcast::Sender<JobEvent>,
}

/// Consumer side, handed to [`WorkerPool::start`]
#[derive(Debug)]
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl JobQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        (Self { tx, events }, JobReceiver { rx })
    }

    pub fn enqueue(&self, kind: JobKind) -> Result<Uuid, EngineError> {
        let job = Job {
            id: Uuid::new_v4(),
            kind,
            attempts: 0,
        };
        let id = job.id;
        tracing::debug!("📥 Enqueued {} job {}", job.kind.name(), id);
        self.tx.send(job).map_err(|_| EngineError::QueueClosed)?;
        Ok(id)
    }

    /// Enqueue once `delay` has elapsed. The job doesn't occupy a worker while waiting.
    pub fn enqueue_after(&self, kind: JobKind, delay: Duration) -> Result<Uuid, EngineError> {
        if self.tx.is_closed() {
            return Err(EngineError::QueueClosed);
        }
        let job = Job {
            id: Uuid::new_v4(),
            kind,
            attempts: 0,
        };
        let id = job.id;
        self.deliver_later(job, delay);
        Ok(id)
    }

    fn deliver_later(&self, job: Job, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let id = job.id;
            if tx.send(job).is_err() {
                tracing::warn!("⚠️ Queue closed before delayed job {} was delivered", id);
            }
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: JobEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Fixed set of worker tasks sharing one receiver
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        receiver: JobReceiver,
        queue: JobQueue,
        processor: Arc<dyn JobProcessor>,
        config: QueueConfig,
    ) -> Self {
        let rx = Arc::new(Mutex::new(receiver.rx));
        let workers = config.workers.max(1);
        tracing::info!("👷 Starting {} queue workers", workers);

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let queue = queue.clone();
                let processor = Arc::clone(&processor);
                tokio::spawn(worker_loop(worker_id, rx, queue, processor, config))
            })
            .collect();

        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
        tracing::info!("⏹️ Queue workers stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    queue: JobQueue,
    processor: Arc<dyn JobProcessor>,
    config: QueueConfig,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(mut job) = next else {
            tracing::debug!("🛑 Worker {} exiting, queue closed", worker_id);
            break;
        };
        job.attempts += 1;

        // Run on its own task so a panicking processor can't take the worker down
        let outcome = {
            let processor = Arc::clone(&processor);
            let job = job.clone();
            tokio::spawn(async move { processor.process(&job).await }).await
        };

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(join_error) => Some(format!("job panicked: {join_error}")),
        };

        let event = match error {
            None => {
                tracing::debug!("✅ Worker {} finished {} job {}", worker_id, job.kind.name(), job.id);
                JobEvent {
                    job_id: job.id,
                    kind: job.kind.name(),
                    attempt: job.attempts,
                    outcome: JobOutcome::Completed,
                }
            }
            Some(error) => {
                let will_retry = job.attempts < config.max_attempts;
                tracing::error!(
                    "❌ {} job {} failed (attempt {}/{}): {}",
                    job.kind.name(),
                    job.id,
                    job.attempts,
                    config.max_attempts,
                    error
                );
                let event = JobEvent {
                    job_id: job.id,
                    kind: job.kind.name(),
                    attempt: job.attempts,
                    outcome: JobOutcome::Failed { error: error.clone(), will_retry },
                };
                if will_retry {
                    let delay = config.backoff(job.attempts);
                    queue.deliver_later(job, delay);
                } else {
                    tracing::warn!("🪦 Giving up on {} job {} after {} attempts", job.kind.name(), job.id, job.attempts);
                    processor.abandon(&job, &error).await;
                }
                event
            }
        };
        queue.publish(event);
    }
}
