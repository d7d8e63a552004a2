use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::scheduler::job::{Job, JobId, JobUpdate, NewJob, UserId};
use crate::store::{FinishedQuery, JobStore};

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<JobId, Job>,
    next_id: JobId,
}

/// Job store backed by an in-process map
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current number of jobs in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    /// Returns true if the store holds no jobs
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }

    /// Get all jobs sorted by id
    pub async fn all_jobs(&self) -> Vec<Job> {
        self.inner.read().await.jobs.values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, new: NewJob) -> Result<Job> {
        new.validate()?;
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let job = Job::from_new(inner.next_id, new);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| !j.is_finished() && !j.is_archived)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.queue_position.is_none(), j.queue_position, j.created_at, j.id));
        Ok(jobs)
    }

    async fn list_finished(&self, query: &FinishedQuery) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| query.matches(j))
            .cloned()
            .collect())
    }

    async fn list_batch(&self, user_id: UserId, created_at: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.user_id == user_id && j.created_at == created_at && j.send_email)
            .cloned()
            .collect())
    }

    async fn list_ids(&self) -> Result<Vec<JobId>> {
        Ok(self.inner.read().await.jobs.keys().copied().collect())
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(&id) {
            Some(job) => {
                update.apply(job);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_positions(&self, positions: &HashMap<JobId, i32>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for (id, pos) in positions {
            if let Some(job) = inner.jobs.get_mut(id) {
                job.queue_position = Some(*pos);
            }
        }
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        Ok(self.inner.write().await.jobs.remove(&id).is_some())
    }
}
