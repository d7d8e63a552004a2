use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{EngineConfig, RemoteConfig};
use crate::error::{EngineError, Result};
use crate::results::{self, ResultFiles, DATA_EXT};
use crate::scheduler::job::{Job, RequestKind};
use crate::store::JobStore;
use crate::worker::command;
use crate::worker::transfer::Transfer;

/// Longest stack log excerpt kept as an error message
const STACK_LOG_EXCERPT: usize = 512;

/// Why a run produced nothing. None of these are the job's fault, so the job stays queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Cancelled,
    TimedOut,
    SpawnFailed,
    TransferFailed,
    MissingArtifact,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::Cancelled => write!(f, "cancelled"),
            RetryReason::TimedOut => write!(f, "timed out"),
            RetryReason::SpawnFailed => write!(f, "ssh could not be started"),
            RetryReason::TransferFailed => write!(f, "result transfer failed"),
            RetryReason::MissingArtifact => write!(f, "result file missing"),
        }
    }
}

/// Result of running a job on the remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The artifact exists locally and holds usable results.
    Completed { artifact: PathBuf },
    /// The job ran to completion but retrying would not help.
    Failed {
        artifact: Option<PathBuf>,
        message: String,
    },
    /// Nothing usable was produced; the job should run again later.
    Retry(RetryReason),
}

impl ExecutionResult {
    /// The `(artifact, error message)` pair: `(None, None)` means retry.
    pub fn into_parts(self) -> (Option<PathBuf>, Option<String>) {
        match self {
            ExecutionResult::Completed { artifact } => (Some(artifact), None),
            ExecutionResult::Failed { artifact, message } => (artifact, Some(message)),
            ExecutionResult::Retry(_) => (None, None),
        }
    }
}

/// Output of a supervised process that ran until it exited
#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }

    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }
}

enum Supervised {
    Exited(ProcessOutput),
    Stopped(RetryReason),
}

/// Runs jobs on the remote photometry host over ssh and fetches their results.
///
/// Every child process (ssh and each scp/rsync copy) is waited on in short
/// polls. Between polls the job record is checked: a deleted record means the
/// job was cancelled and the child is killed. A run that exceeds the time
/// limit, counted from the start of the first step, is killed too and
/// reported as retryable.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    remote: RemoteConfig,
    files: ResultFiles,
    poll_interval: Duration,
    max_runtime: Duration,
    progress_interval: Duration,
}

impl RemoteExecutor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            remote: config.remote.clone(),
            files: ResultFiles::new(&config.results_dir),
            poll_interval: config.poll_interval,
            max_runtime: config.task_max_time,
            progress_interval: config.progress_log_interval,
        }
    }

    pub fn files(&self) -> &ResultFiles {
        &self.files
    }

    pub async fn execute(&self, job: &Job, store: &dyn JobStore) -> Result<ExecutionResult> {
        let plan = match command::plan(job, &self.remote, &self.files, command::mjd_now()) {
            Ok(plan) => plan,
            Err(EngineError::InvalidJob(message)) => {
                tracing::error!(job_id = job.id, error = %message, "Job cannot be run");
                return Ok(ExecutionResult::Failed {
                    artifact: None,
                    message,
                });
            }
            Err(e) => return Err(e),
        };
        self.files.ensure_dir().await?;
        let deadline = Instant::now() + self.max_runtime;

        if let Some(upload) = &plan.upload {
            // a failed upload surfaces later as a missing artifact
            if let Err(reason) = self.transfer(job, store, upload, deadline).await? {
                return Ok(ExecutionResult::Retry(reason));
            }
        }

        tracing::info!(
            job_id = job.id,
            host = %self.remote.host,
            command = %plan.command,
            "Executing remote command"
        );
        let mut ssh = Command::new(&self.remote.ssh_program);
        ssh.arg(&self.remote.host).arg(&plan.command);
        let output = match self.supervise(job, store, ssh, "ssh", deadline).await? {
            Supervised::Exited(output) => output,
            Supervised::Stopped(reason) => return Ok(ExecutionResult::Retry(reason)),
        };
        if !output.stdout.is_empty() {
            tracing::info!(
                job_id = job.id,
                "{} STDOUT: ({} lines of output)",
                self.remote.host,
                output.stdout.lines().count()
            );
        }
        for line in output.stderr.lines() {
            tracing::info!(job_id = job.id, "{} STDERR: {line}", self.remote.host);
        }

        if !store.exists(job.id).await? {
            return Ok(ExecutionResult::Retry(RetryReason::Cancelled));
        }

        for transfer in &plan.downloads {
            match self.transfer(job, store, transfer, deadline).await? {
                Ok(false) if transfer.required => {
                    return Ok(ExecutionResult::Retry(RetryReason::TransferFailed));
                }
                Ok(_) => {}
                Err(reason) => return Ok(ExecutionResult::Retry(reason)),
            }
        }

        self.classify(job, &plan.artifact).await
    }

    /// Run one copy under supervision. `Ok(success)` when the copy exited,
    /// `Err(reason)` when it was stopped for cancellation or the time limit.
    async fn transfer(
        &self,
        job: &Job,
        store: &dyn JobStore,
        transfer: &Transfer,
        deadline: Instant,
    ) -> Result<std::result::Result<bool, RetryReason>> {
        tracing::info!(job_id = job.id, command = %transfer.command_line(), "Transferring");
        match self
            .supervise(job, store, transfer.command(), transfer.name(), deadline)
            .await?
        {
            Supervised::Exited(output) => Ok(Ok(transfer.report(&output))),
            Supervised::Stopped(RetryReason::SpawnFailed) => Ok(Ok(false)),
            Supervised::Stopped(reason) => Ok(Err(reason)),
        }
    }

    /// Spawn `command` and wait for it in polls of `poll_interval`, killing it
    /// if the job record disappears or `deadline` passes.
    async fn supervise(
        &self,
        job: &Job,
        store: &dyn JobStore,
        mut command: Command,
        name: &str,
        deadline: Instant,
    ) -> Result<Supervised> {
        let spawned = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = job.id, program = name, error = %e, "Failed to start {name}");
                return Ok(Supervised::Stopped(RetryReason::SpawnFailed));
            }
        };

        // drain both pipes concurrently so a chatty command cannot block on a full pipe
        let stdout = child.stdout.take().map(|out| tokio::spawn(read_all(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_all(err)));

        let started = Instant::now();
        let mut last_progress = started;

        let status = loop {
            match tokio::time::timeout(self.poll_interval, child.wait()).await {
                Ok(status) => break status,
                Err(_) => {
                    if last_progress.elapsed() >= self.progress_interval {
                        let elapsed_secs = started.elapsed().as_secs();
                        tracing::info!(job_id = job.id, elapsed_secs, "{name} has been running for {elapsed_secs} seconds");
                        last_progress = Instant::now();
                    }

                    let reason = if !store.exists(job.id).await? {
                        tracing::info!(job_id = job.id, "Job was cancelled, killing {name}");
                        RetryReason::Cancelled
                    } else if Instant::now() >= deadline {
                        tracing::error!(
                            job_id = job.id,
                            limit_secs = self.max_runtime.as_secs(),
                            "{name} was killed after reaching the run time limit"
                        );
                        RetryReason::TimedOut
                    } else {
                        continue;
                    };

                    if let Err(e) = child.kill().await {
                        tracing::warn!(job_id = job.id, error = %e, "Failed to kill {name}");
                    }
                    abort_reader(stdout);
                    abort_reader(stderr);
                    return Ok(Supervised::Stopped(reason));
                }
            }
        };

        tracing::info!(
            job_id = job.id,
            exit_code = ?status.as_ref().ok().and_then(|s| s.code()),
            "{name} finished after running for {:.1} seconds",
            started.elapsed().as_secs_f64()
        );
        let status = match status {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Failed to wait for {name}");
                None
            }
        };

        Ok(Supervised::Exited(ProcessOutput {
            status,
            stdout: collect_reader(stdout).await,
            stderr: collect_reader(stderr).await,
        }))
    }

    async fn classify(&self, job: &Job, artifact: &Path) -> Result<ExecutionResult> {
        let artifact_exists = tokio::fs::try_exists(artifact).await?;

        if job.kind == RequestKind::ImageStack && !artifact_exists {
            // the stacking script explains itself in its log when it produced no image
            let log = self.files.path(job.id, DATA_EXT);
            if tokio::fs::try_exists(&log).await? {
                let contents = tokio::fs::read_to_string(&log).await?;
                return Ok(ExecutionResult::Failed {
                    artifact: None,
                    message: truncate(&contents, STACK_LOG_EXCERPT),
                });
            }
        }

        if !artifact_exists {
            tracing::warn!(job_id = job.id, path = %artifact.display(), "Result file was not created");
            return Ok(ExecutionResult::Retry(RetryReason::MissingArtifact));
        }

        if job.kind == RequestKind::PhotometryData && results::count_data_rows(artifact).await? == 0 {
            return Ok(ExecutionResult::Failed {
                artifact: Some(artifact.to_path_buf()),
                message: "No data returned".to_string(),
            });
        }

        Ok(ExecutionResult::Completed {
            artifact: artifact.to_path_buf(),
        })
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        tracing::debug!(error = %e, "Error reading ssh output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect_reader(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

fn abort_reader(handle: Option<JoinHandle<String>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

fn truncate(text: &str, max_bytes: usize) -> String {
    let mut end = max_bytes.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
