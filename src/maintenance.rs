use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::results::ResultFiles;
use crate::scheduler::job::RequestKind;
use crate::store::{delete_job, DeleteMode, Deletion, FinishedQuery, JobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionAction {
    /// Delete result files and flag the record as archived
    Archive,
    /// Delete result files and the record
    Purge,
}

/// Age-based retention policy for finished jobs
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionRule {
    pub older_than_days: i64,
    pub action: RetentionAction,
    pub kind: Option<RequestKind>,
    pub archived: Option<bool>,
    pub from_api: Option<bool>,
}

impl RetentionRule {
    pub fn archive(older_than_days: i64) -> Self {
        Self {
            older_than_days,
            action: RetentionAction::Archive,
            kind: None,
            archived: None,
            from_api: None,
        }
    }

    pub fn purge(older_than_days: i64) -> Self {
        Self {
            action: RetentionAction::Purge,
            ..Self::archive(older_than_days)
        }
    }

    pub fn kind(mut self, kind: RequestKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    pub fn from_api(mut self, from_api: bool) -> Self {
        self.from_api = Some(from_api);
        self
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::archive(14).kind(RequestKind::ImageZip),
            Self::archive(14).kind(RequestKind::ImageStack),
            Self::archive(183).kind(RequestKind::PhotometryData),
            Self::purge(7).archived(true).from_api(true),
            Self::purge(31).from_api(true),
            Self::purge(365),
        ]
    }

    /// Archiving only ever selects rows that are not archived yet.
    pub fn query(&self, now: DateTime<Utc>) -> FinishedQuery {
        FinishedQuery {
            finished_before: now - chrono::Duration::days(self.older_than_days),
            kind: self.kind,
            archived: match self.action {
                RetentionAction::Archive => Some(false),
                RetentionAction::Purge => self.archived,
            },
            from_api: self.from_api,
        }
    }

    fn mode(&self) -> DeleteMode {
        match self.action {
            RetentionAction::Archive => DeleteMode::Soft,
            RetentionAction::Purge => DeleteMode::Hard,
        }
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        match self.archived {
            Some(true) => parts.push("archived".to_string()),
            Some(false) => parts.push("non-archived".to_string()),
            None => {}
        }
        if let Some(kind) = self.kind {
            parts.push(kind.code().to_string());
        }
        match self.from_api {
            Some(true) => parts.push("API".to_string()),
            Some(false) => parts.push("web".to_string()),
            None => {}
        }
        parts.push(format!("jobs finished more than {} days ago", self.older_than_days));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub archived: usize,
    pub removed: usize,
    pub orphan_files: usize,
}

/// Periodically applies the retention rules.
pub struct Sweeper {
    store: Arc<dyn JobStore>,
    files: ResultFiles,
    rules: Vec<RetentionRule>,
    interval: Duration,
    prune_orphans: bool,
    max_time: Duration,
}

impl Sweeper {
    pub fn new(config: &EngineConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            files: ResultFiles::new(&config.results_dir),
            rules: config.retention.clone(),
            interval: config.maintenance_interval,
            prune_orphans: config.prune_orphan_files,
            max_time: config.maintenance_max_time,
        }
    }

    pub fn with_orphan_pruning(mut self, enabled: bool) -> Self {
        self.prune_orphans = enabled;
        self
    }

    /// One pass over every rule. Running it twice in a row changes nothing the second time.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for rule in &self.rules {
            let matching = self.store.list_finished(&rule.query(now)).await?;
            let verb = match rule.action {
                RetentionAction::Archive => "archived",
                RetentionAction::Purge => "hard deleted",
            };
            tracing::info!(
                count = matching.len(),
                "Maintenance: {} {} to be {verb}",
                matching.len(),
                rule.describe()
            );

            for job in matching {
                match delete_job(self.store.as_ref(), &self.files, job.id, rule.mode()).await? {
                    Deletion::Archived => report.archived += 1,
                    Deletion::Removed => report.removed += 1,
                    Deletion::NotFound => {}
                }
            }
        }

        if self.prune_orphans {
            let known: HashSet<_> = self.store.list_ids().await?.into_iter().collect();
            report.orphan_files = self.files.prune_orphans(&known, self.max_time).await?;
        }

        tracing::info!(
            archived = report.archived,
            removed = report.removed,
            orphan_files = report.orphan_files,
            "Maintenance pass finished"
        );
        Ok(report)
    }

    /// Run a pass now and then every interval until shutdown. A pass that
    /// overruns the interval causes the missed ticks to be skipped.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Maintenance stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once(Utc::now()).await {
                            tracing::error!(error = %e, "Maintenance pass failed");
                        }
                    }
                }
            }
        })
    }
}
