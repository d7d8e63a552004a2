//! Persistent job records.
//!
//! The [`JobStore`] trait is the only way the scheduler, ranker and sweeper
//! touch job state. Two implementations exist:
//!
//! - [`MemoryJobStore`]: in-process map, used by tests and local dry runs
//! - [`PgJobStore`]: Postgres via `sqlx`, used in production
//!
//! Deletion is not a plain row removal: [`delete_job`] also cleans up result
//! files and decides between archiving the row and removing it.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::results::ResultFiles;
use crate::scheduler::job::{Job, JobId, JobUpdate, NewJob, RequestKind, UserId};

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

/// Selects finished jobs for the retention sweep. `None` filters match anything.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedQuery {
    pub finished_before: DateTime<Utc>,
    pub kind: Option<RequestKind>,
    pub archived: Option<bool>,
    pub from_api: Option<bool>,
}

impl FinishedQuery {
    pub fn matches(&self, job: &Job) -> bool {
        job.finished_at.is_some_and(|at| at < self.finished_before)
            && self.kind.map_or(true, |kind| job.kind == kind)
            && self.archived.map_or(true, |archived| job.is_archived == archived)
            && self.from_api.map_or(true, |from_api| job.from_api == from_api)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a validated job and return it with its assigned id.
    async fn insert(&self, job: NewJob) -> Result<Job>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    async fn exists(&self, id: JobId) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    /// Unfinished, non-archived jobs ordered by queue position (unranked last),
    /// then creation time.
    async fn list_unfinished(&self) -> Result<Vec<Job>>;

    async fn list_finished(&self, query: &FinishedQuery) -> Result<Vec<Job>>;

    /// Jobs of one user submitted together that asked for a notification.
    async fn list_batch(&self, user_id: UserId, created_at: DateTime<Utc>) -> Result<Vec<Job>>;

    async fn list_ids(&self) -> Result<Vec<JobId>>;

    /// Returns false when the job no longer exists.
    async fn update(&self, id: JobId, update: JobUpdate) -> Result<bool>;

    async fn set_positions(&self, positions: &HashMap<JobId, i32>) -> Result<()>;

    /// Remove the row outright. Returns false when it was already gone.
    async fn remove(&self, id: JobId) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Archive finished jobs, remove unfinished ones.
    Soft,
    /// Always remove the row.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    NotFound,
    Archived,
    Removed,
}

/// Delete a job's files and then archive or remove its record.
///
/// An unfinished job is always removed, which is what cancels it: the slot
/// running it notices the missing row on its next poll.
pub async fn delete_job(
    store: &dyn JobStore,
    files: &ResultFiles,
    id: JobId,
    mode: DeleteMode,
) -> Result<Deletion> {
    let Some(job) = store.get(id).await? else {
        return Ok(Deletion::NotFound);
    };

    files.remove_job_files(&job).await?;

    let archive = mode == DeleteMode::Soft && job.is_finished() && !job.is_archived;
    if archive {
        store.update(id, JobUpdate::archived()).await?;
        tracing::info!(job_id = id, "Job archived");
        Ok(Deletion::Archived)
    } else if store.remove(id).await? {
        tracing::info!(job_id = id, finished = job.is_finished(), "Job removed");
        Ok(Deletion::Removed)
    } else {
        Ok(Deletion::NotFound)
    }
}
