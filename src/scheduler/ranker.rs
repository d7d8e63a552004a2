//! Round-robin queue positions.
//!
//! Position 0 belongs to the job that has been running longest. Everything
//! else is handed out in sweeps over jobs sorted by (user, creation time):
//! each sweep gives at most one position per user, so a user with many
//! queued jobs cannot push another user's single job to the back. The
//! running job's owner sits out the first sweep.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::scheduler::job::{Job, JobId};
use crate::store::JobStore;

/// Compute relative positions for every unfinished job.
///
/// The result is a permutation of `0..jobs.len()` and depends only on each
/// job's user, creation time, start time and id.
pub fn compute_positions(jobs: &[Job]) -> HashMap<JobId, i32> {
    let mut ordered: Vec<&Job> = jobs.iter().collect();
    ordered.sort_by_key(|j| (j.user_id, j.created_at, j.id));

    let mut positions = HashMap::with_capacity(ordered.len());
    let mut next: i32 = 0;

    let running = ordered
        .iter()
        .filter_map(|j| j.started_at.map(|started| (started, j.id, j.user_id)))
        .min();
    let running_user = running.map(|(_, id, user)| {
        positions.insert(id, next);
        next += 1;
        user
    });

    let mut remaining: Vec<&Job> = ordered
        .into_iter()
        .filter(|j| !positions.contains_key(&j.id))
        .collect();

    let mut first_sweep = true;
    while !remaining.is_empty() {
        let mut served = HashSet::new();
        if first_sweep {
            served.extend(running_user);
            first_sweep = false;
        }
        remaining.retain(|job| {
            if !served.insert(job.user_id) {
                return true;
            }
            positions.insert(job.id, next);
            next += 1;
            false
        });
    }

    positions
}

/// Recompute and persist positions for the current unfinished set.
pub async fn rerank(store: &dyn JobStore) -> Result<usize> {
    let jobs = store.list_unfinished().await?;
    let positions = compute_positions(&jobs);
    store.set_positions(&positions).await?;
    tracing::debug!(jobs = positions.len(), "Queue positions updated");
    Ok(positions.len())
}
