//! Completion notifications.
//!
//! Jobs submitted together (same user, same creation timestamp, notification
//! requested) form a batch. The notification goes out once, when the last job
//! of the batch finishes, and lists every job in it.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::NotifyConfig;
use crate::error::Result;
use crate::results::{ResultFiles, DATA_EXT, PLOT_EXT};
use crate::scheduler::job::Job;
use crate::store::JobStore;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            to = %notification.to,
            subject = %notification.subject,
            attachments = notification.attachments.len(),
            "Notification ready:\n{}",
            notification.body
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyDecision {
    NotRequested,
    ApiOrigin,
    NoAddress,
    /// Other jobs of the batch are still running.
    Deferred { unfinished: usize, total: usize },
    Sent { jobs: usize },
}

/// Send the batch notification for `job` if it was requested and the batch is complete.
pub async fn notify_if_needed(
    store: &dyn JobStore,
    notifier: &dyn Notifier,
    files: &ResultFiles,
    config: &NotifyConfig,
    job: &Job,
) -> Result<NotifyDecision> {
    if !job.send_email {
        tracing::info!(job_id = job.id, user = %job.username, "Completed, no notification requested");
        return Ok(NotifyDecision::NotRequested);
    }
    if job.from_api {
        tracing::info!(job_id = job.id, "Notification requested for an API job, not sending");
        return Ok(NotifyDecision::ApiOrigin);
    }
    let Some(to) = job.email.clone().filter(|e| !e.trim().is_empty()) else {
        tracing::warn!(job_id = job.id, user = %job.username, "Completed, but user has no email address");
        return Ok(NotifyDecision::NoAddress);
    };

    let batch = store.list_batch(job.user_id, job.created_at).await?;
    let total = batch.len();
    let unfinished = batch
        .iter()
        .filter(|b| !b.is_finished() && b.id != job.id)
        .count();
    if unfinished > 0 {
        tracing::info!(
            job_id = job.id,
            "Waiting to notify until remaining {unfinished} of {total} batched jobs are finished"
        );
        return Ok(NotifyDecision::Deferred { unfinished, total });
    }

    let notification = Notification {
        to,
        subject: config.subject.clone(),
        body: render_body(&batch, config),
        attachments: pick_attachments(&batch, files, config.max_attachment_mb).await,
    };
    tracing::info!(job_id = job.id, to = %notification.to, jobs = total, "Sending notification");
    notifier.send(&notification).await?;
    Ok(NotifyDecision::Sent { jobs: total })
}

fn render_body(batch: &[Job], config: &NotifyConfig) -> String {
    let lines: Vec<String> = batch
        .iter()
        .map(|job| {
            let flavour = if job.use_reduced {
                "img_reduced"
            } else {
                "img_difference"
            };
            let mut line = format!(
                "Task {}: {} {flavour} \n{}{}/\n",
                job.id, job.target, config.task_url_base, job.id
            );
            if let Some(comment) = &job.comment {
                line.push_str(&format!(" comment: '{comment}'"));
            }
            line
        })
        .collect();
    format!(
        "Your forced photometry results are available for:\n\n{}\n\n",
        lines.join("\n")
    )
}

/// Data tables first, then plots, while the running total stays under the cap.
async fn pick_attachments(batch: &[Job], files: &ResultFiles, max_mb: f64) -> Vec<PathBuf> {
    let mut attached = Vec::new();
    let mut total_mb = 0.0;
    for ext in [DATA_EXT, PLOT_EXT] {
        for job in batch {
            let path = files.path(job.id, ext);
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            let size_mb = meta.len() as f64 / BYTES_PER_MB;
            if total_mb + size_mb < max_mb {
                total_mb += size_mb;
                attached.push(path);
            }
        }
    }
    attached
}
