//! Slot scheduling for queued jobs.
//!
//! The [`Scheduler`] owns a fixed pool of slots and, on every pass of its
//! loop, frees slots whose task has exited and fills idle slots with queued
//! jobs in queue-position order. A user never has more than one job in a
//! slot at once.
//!
//! # Components
//!
//! - [`job`]: job records and submission validation
//! - [`ranker`]: round-robin queue positions
//! - [`assigner`]: slot bookkeeping and exclusivity checks
//!
//! # Slot lifecycle
//!
//! 1. The job is stamped as started and a task is spawned for the slot
//! 2. The task runs the job through [`RemoteExecutor`]
//! 3. A deleted job has its files removed and is forgotten
//! 4. A terminal result is persisted, the queue is re-ranked and the
//!    owner is notified
//! 5. A retryable result or an error leaves the job queued after a short pause
//! 6. The next scheduler pass sees the task has exited and frees the slot

pub mod assigner;
pub mod job;
pub mod ranker;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{EngineConfig, NotifyConfig};
use crate::error::Result;
use crate::notify::{notify_if_needed, Notifier};
use crate::results::ResultFiles;
use crate::store::{delete_job, DeleteMode, Deletion, JobStore};
use crate::worker::executor::{ExecutionResult, RemoteExecutor};

pub use assigner::{Lease, SlotAssigner, SlotState, SlotView};
pub use job::{Job, JobId, JobStatus, JobUpdate, NewJob, RequestKind, Target, UserId};

/// How a slot task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    Succeeded,
    Failed,
    Cancelled,
    Retry,
}

/// Validate and queue a new job, then refresh queue positions.
pub async fn submit_job(store: &dyn JobStore, new: NewJob) -> Result<Job> {
    let job = store.insert(new).await?;
    ranker::rerank(store).await?;
    tracing::info!(job_id = job.id, user_id = job.user_id, kind = %job.kind, "Job submitted");
    Ok(store.get(job.id).await?.unwrap_or(job))
}

/// Delete a job the way its owner would. Unfinished jobs are removed, which
/// cancels them if they are running; finished jobs are archived.
pub async fn cancel_job(store: &dyn JobStore, files: &ResultFiles, id: JobId) -> Result<Deletion> {
    let deletion = delete_job(store, files, id, DeleteMode::Soft).await?;
    if deletion == Deletion::Removed {
        ranker::rerank(store).await?;
    }
    Ok(deletion)
}

#[derive(Clone)]
struct SlotContext {
    store: Arc<dyn JobStore>,
    executor: Arc<RemoteExecutor>,
    notifier: Arc<dyn Notifier>,
    notify: NotifyConfig,
    retry_pause: Duration,
    rank_lock: Arc<Mutex<()>>,
}

impl SlotContext {
    /// Re-rank under a lock so concurrent slot completions do not interleave.
    async fn rerank(&self) -> Result<()> {
        let _guard = self.rank_lock.lock().await;
        ranker::rerank(self.store.as_ref()).await?;
        Ok(())
    }
}

pub struct Scheduler {
    ctx: SlotContext,
    slots: Arc<RwLock<SlotAssigner>>,
    loop_interval: Duration,
    waiting_logged: bool,
}

impl Scheduler {
    pub fn new(config: &EngineConfig, store: Arc<dyn JobStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            ctx: SlotContext {
                store,
                executor: Arc::new(RemoteExecutor::new(config)),
                notifier,
                notify: config.notify.clone(),
                retry_pause: config.retry_pause,
                rank_lock: Arc::new(Mutex::new(())),
            },
            slots: Arc::new(RwLock::new(SlotAssigner::new(config.num_slots))),
            loop_interval: config.loop_interval,
            waiting_logged: false,
        }
    }

    /// Shared handle to the slot table, for status reporting.
    pub fn slots(&self) -> Arc<RwLock<SlotAssigner>> {
        self.slots.clone()
    }

    /// Loop until shutdown. Store errors end the loop and are returned.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let num_slots = self.slots.read().await.num_slots();
        tracing::info!(num_slots, "Scheduler started");

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.loop_interval) => {}
            }
            if let Err(e) = self.tick().await {
                break Err(e);
            }
        };

        let aborted = self.slots.write().await.abort_all();
        tracing::info!(aborted, "Scheduler stopped");
        result
    }

    /// One scheduling pass. Returns the number of jobs started.
    pub async fn tick(&mut self) -> Result<usize> {
        let mut slots = self.slots.write().await;

        let freed = slots.reap().await;
        for (slot, lease) in freed {
            tracing::info!(
                slot,
                job_id = lease.job_id,
                "slot {slot} is now free. {} of {} slots are available",
                slots.free_slots(),
                slots.num_slots()
            );
        }

        let mut queued = self.ctx.store.list_unfinished().await?;
        if queued.is_empty() {
            if !self.waiting_logged {
                tracing::info!("Waiting for jobs...");
                self.waiting_logged = true;
            }
            return Ok(0);
        }

        let mut launched = 0;
        while let Some(slot) = slots.first_idle() {
            let Some(mut job) = slots.select_job(&queued).cloned() else {
                break;
            };
            queued.retain(|j| j.id != job.id);

            let now = Utc::now();
            if !self.ctx.store.update(job.id, JobUpdate::started(now)).await? {
                tracing::debug!(job_id = job.id, "Job vanished before it could start");
                continue;
            }
            job.started_at.get_or_insert(now);

            slots.assign(slot, &job, now)?;
            let handle = tokio::spawn(run_slot(self.ctx.clone(), slot, job.clone()));
            slots.launch(slot, handle)?;
            launched += 1;

            tracing::info!(
                slot,
                job_id = job.id,
                user_id = job.user_id,
                "Starting job {} in slot {slot}. {} of {} slots are available",
                job.id,
                slots.free_slots(),
                slots.num_slots()
            );
        }
        drop(slots);

        if launched > 0 {
            self.waiting_logged = false;
            self.ctx.rerank().await?;
        }
        Ok(launched)
    }
}

async fn run_slot(ctx: SlotContext, slot: usize, job: Job) {
    let span = tracing::info_span!("slot", slot, job_id = job.id);
    async move {
        match process_job(&ctx, &job).await {
            Ok(outcome) => tracing::debug!(?outcome, "Slot task finished"),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Slot task failed. Waiting {} seconds...",
                    ctx.retry_pause.as_secs()
                );
                tokio::time::sleep(ctx.retry_pause).await;
            }
        }
    }
    .instrument(span)
    .await
}

async fn process_job(ctx: &SlotContext, job: &Job) -> Result<SlotOutcome> {
    tracing::info!(
        user = %job.username,
        kind = %job.kind,
        target = %job.target,
        use_reduced = job.use_reduced,
        mjd_min = ?job.mjd_min,
        mjd_max = ?job.mjd_max,
        parent_id = ?job.parent_id,
        "Starting job"
    );

    let result = ctx.executor.execute(job, ctx.store.as_ref()).await?;

    if !ctx.store.exists(job.id).await? {
        return cleanup_cancelled(ctx, job).await;
    }

    match result {
        ExecutionResult::Completed { artifact } => {
            tracing::info!(artifact = %artifact.display(), "Job completed");
            finish(ctx, job, None).await
        }
        ExecutionResult::Failed { message, .. } => {
            tracing::warn!(error = %message, "Job failed");
            finish(ctx, job, Some(message)).await
        }
        ExecutionResult::Retry(reason) => {
            tracing::error!(
                %reason,
                "Job was not completed successfully. Waiting {} seconds...",
                ctx.retry_pause.as_secs()
            );
            tokio::time::sleep(ctx.retry_pause).await;
            Ok(SlotOutcome::Retry)
        }
    }
}

async fn cleanup_cancelled(ctx: &SlotContext, job: &Job) -> Result<SlotOutcome> {
    tracing::info!("Job was cancelled, removing result files");
    ctx.executor.files().remove_job_files(job).await?;
    Ok(SlotOutcome::Cancelled)
}

async fn finish(ctx: &SlotContext, job: &Job, error_msg: Option<String>) -> Result<SlotOutcome> {
    let now = Utc::now();
    let failed = error_msg.is_some();
    if !ctx
        .store
        .update(job.id, JobUpdate::finished(now, error_msg.clone()))
        .await?
    {
        return cleanup_cancelled(ctx, job).await;
    }
    ctx.rerank().await?;

    let mut finished = job.clone();
    finished.finished_at = Some(now);
    finished.error_msg = error_msg;
    finished.queue_position = None;
    if let Err(e) = notify_if_needed(
        ctx.store.as_ref(),
        ctx.notifier.as_ref(),
        ctx.executor.files(),
        &ctx.notify,
        &finished,
    )
    .await
    {
        tracing::warn!(error = %e, "Failed to send notification");
    }

    Ok(if failed {
        SlotOutcome::Failed
    } else {
        SlotOutcome::Succeeded
    })
}
