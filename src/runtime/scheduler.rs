/// Background cron scheduler service
///
/// Schedules live in the store (derived from `trigger_schedule` nodes when a
/// workflow is saved). A tokio-cron-scheduler job calls [`Scheduler::tick`] on a
/// fixed cadence; each tick claims every due schedule with a compare-and-set on
/// `next_run` and enqueues one `Execute` job per successful claim. Several
/// scheduler instances may share a store without double-firing.

use crate::error::EngineError;
use crate::runtime::engine::ExecutionRequest;
use crate::runtime::queue::{JobKind, JobQueue};
use crate::store::{Schedule, Store};
use crate::workflow::triggers::next_fire;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// What one tick did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Claimed and enqueued
    pub fired: Vec<Uuid>,
    /// Claimed, but the workflow was gone or inactive
    pub skipped: Vec<Uuid>,
    /// Bad cron/timezone; left due and not enqueued
    pub invalid: Vec<Uuid>,
    /// Claimed by another instance first
    pub lost: Vec<Uuid>,
}

/// Claims due schedules and turns them into `Execute` jobs
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    queue: JobQueue,
}

impl Scheduler {
    /// Reads schedules from `store` and enqueues on `queue`
    pub fn new(store: Arc<dyn Store>, queue: JobQueue) -> Self {
        Self { store, queue }
    }

    /// Fire every schedule due at `now`. A schedule advances whether or not the
    /// resulting execution later succeeds.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let due = self.store.due_schedules(now).await?;
        let mut report = TickReport::default();

        for schedule in due {
            let next_run = match next_fire(&schedule.cron, &schedule.timezone, now) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(
                        "❌ Schedule {} ({}:{}) has an unusable cron '{}': {}",
                        schedule.id,
                        schedule.workflow_id,
                        schedule.node_id,
                        schedule.cron,
                        e
                    );
                    report.invalid.push(schedule.id);
                    continue;
                }
            };

            let claimed = self
                .store
                .claim_schedule(schedule.id, schedule.next_run, now, next_run)
                .await?;
            if !claimed {
                tracing::debug!("🔒 Schedule {} already claimed elsewhere", schedule.id);
                report.lost.push(schedule.id);
                continue;
            }

            if self.fire(&schedule, now).await? {
                report.fired.push(schedule.id);
            } else {
                report.skipped.push(schedule.id);
            }
        }

        if !report.fired.is_empty() {
            tracing::info!("⏰ Scheduler tick fired {} schedule(s)", report.fired.len());
        }
        Ok(report)
    }

    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let workflow = match self.store.get_workflow(&schedule.workflow_id).await? {
            Some(workflow) if workflow.active => workflow,
            _ => {
                tracing::warn!(
                    "⚠️ Schedule {} points at missing or inactive workflow '{}'",
                    schedule.id,
                    schedule.workflow_id
                );
                return Ok(false);
            }
        };

        let seed = json!({
            "scheduled_at": schedule.next_run,
            "fired_at": now,
            "cron": schedule.cron,
            "timezone": schedule.timezone,
        });
        let owner = workflow.user_id.clone();
        let request = ExecutionRequest::new(workflow, seed)
            .owned_by(owner)
            .starting_at(&schedule.node_id);
        self.queue.enqueue(JobKind::Execute(request))?;

        tracing::debug!("🔔 Schedule {} enqueued workflow '{}'", schedule.id, schedule.workflow_id);
        Ok(true)
    }
}

/// Runs [`Scheduler::tick`] on a repeating tokio-cron-scheduler job
pub struct SchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    ticker: Scheduler,
    every: Duration,
}

impl SchedulerService {
    /// Creates the underlying job scheduler; nothing fires until [`Self::start`]
    pub async fn new(ticker: Scheduler, every: Duration) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            ticker,
            every,
        })
    }

    /// Registers the repeating tick job and starts the scheduler
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting cron scheduler service (tick every {:?})", self.every);

        let ticker = self.ticker.clone();
        let job = Job::new_repeated_async(self.every, move |_uuid, _l| {
            let ticker = ticker.clone();
            Box::pin(async move {
                if let Err(e) = ticker.tick(Utc::now()).await {
                    tracing::error!("❌ Scheduler tick failed: {}", e);
                }
            })
        })?;

        {
            let scheduler = self.scheduler.read().await;
            scheduler.add(job).await?;
            scheduler.start().await?;
        }

        tracing::info!("✅ Cron scheduler started");
        Ok(())
    }

    /// Shuts the scheduler down; no further ticks fire
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron scheduler service");
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }
        tracing::info!("✅ Cron scheduler stopped");
        Ok(())
    }
}
