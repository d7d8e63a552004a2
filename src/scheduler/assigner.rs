use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result};
use crate::scheduler::job::{Job, JobId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Assigned,
    Running,
}

/// The job a slot is holding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub job_id: JobId,
    pub user_id: UserId,
    pub since: DateTime<Utc>,
}

/// Point-in-time view of one slot, for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub slot: usize,
    pub state: SlotState,
    #[serde(flatten)]
    pub lease: Option<Lease>,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    lease: Option<Lease>,
    handle: Option<JoinHandle<()>>,
}

impl Slot {
    fn idle() -> Self {
        Self {
            state: SlotState::Idle,
            lease: None,
            handle: None,
        }
    }
}

/// Fixed pool of execution slots.
///
/// At most one slot holds any given job and at most one slot holds a job
/// of any given user.
#[derive(Debug)]
pub struct SlotAssigner {
    slots: Vec<Slot>,
}

impl SlotAssigner {
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: (0..num_slots).map(|_| Slot::idle()).collect(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Idle)
            .count()
    }

    /// Lowest-numbered idle slot
    pub fn first_idle(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.state == SlotState::Idle)
    }

    pub fn busy_users(&self) -> HashSet<UserId> {
        self.slots
            .iter()
            .filter_map(|s| s.lease.map(|l| l.user_id))
            .collect()
    }

    pub fn busy_jobs(&self) -> HashSet<JobId> {
        self.slots
            .iter()
            .filter_map(|s| s.lease.map(|l| l.job_id))
            .collect()
    }

    /// First job in queue order whose user and id are not already in a slot.
    pub fn select_job<'a>(&self, queued: &'a [Job]) -> Option<&'a Job> {
        let users = self.busy_users();
        let jobs = self.busy_jobs();
        queued
            .iter()
            .find(|j| !users.contains(&j.user_id) && !jobs.contains(&j.id))
    }

    /// Reserve an idle slot for a job.
    pub fn assign(&mut self, slot: usize, job: &Job, since: DateTime<Utc>) -> Result<()> {
        if self.busy_users().contains(&job.user_id) {
            return Err(EngineError::UserBusy(job.user_id));
        }
        if self.busy_jobs().contains(&job.id) {
            return Err(EngineError::Internal(format!(
                "job {} is already in a slot",
                job.id
            )));
        }
        let entry = self
            .slots
            .get_mut(slot)
            .filter(|s| s.state == SlotState::Idle)
            .ok_or(EngineError::SlotBusy(slot))?;
        entry.state = SlotState::Assigned;
        entry.lease = Some(Lease {
            job_id: job.id,
            user_id: job.user_id,
            since,
        });
        tracing::debug!(slot, job_id = job.id, user_id = job.user_id, "Slot assigned");
        Ok(())
    }

    /// Attach the running task to an assigned slot.
    pub fn launch(&mut self, slot: usize, handle: JoinHandle<()>) -> Result<()> {
        let entry = self
            .slots
            .get_mut(slot)
            .filter(|s| s.state == SlotState::Assigned)
            .ok_or_else(|| EngineError::Internal(format!("slot {slot} was not assigned")))?;
        entry.state = SlotState::Running;
        entry.handle = Some(handle);
        Ok(())
    }

    /// Return a slot to idle without waiting on it.
    pub fn release(&mut self, slot: usize) -> Option<Lease> {
        let entry = self.slots.get_mut(slot)?;
        let lease = entry.lease.take();
        *entry = Slot::idle();
        lease
    }

    /// Free every slot whose task has exited. Returns the slots released.
    pub async fn reap(&mut self) -> Vec<(usize, Lease)> {
        let mut freed = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let finished = slot.handle.as_ref().is_some_and(|h| h.is_finished());
            if !finished {
                continue;
            }
            if let Some(handle) = slot.handle.take() {
                if let Err(e) = handle.await {
                    tracing::error!(slot = index, error = %e, "Slot task panicked");
                }
            }
            if let Some(lease) = slot.lease.take() {
                freed.push((index, lease));
            }
            *slot = Slot::idle();
        }
        freed
    }

    /// Abort every running slot task and mark all slots idle.
    pub fn abort_all(&mut self) -> usize {
        let mut aborted = 0;
        for slot in self.slots.iter_mut() {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
                aborted += 1;
            }
            *slot = Slot::idle();
        }
        aborted
    }

    pub fn views(&self) -> Vec<SlotView> {
        self.slots
            .iter()
            .enumerate()
            .map(|(slot, s)| SlotView {
                slot,
                state: s.state,
                lease: s.lease,
            })
            .collect()
    }
}
