use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::maintenance::RetentionRule;

pub const DEFAULT_NUM_SLOTS: usize = 8;

/// How to reach the remote photometry host and what to run there.
///
/// Every program and script is configurable so tests can substitute local
/// stand-ins for `ssh` and the remote tooling.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// ssh host alias of the compute server
    pub host: String,
    pub ssh_program: String,
    pub scp_program: String,
    pub rsync_program: String,
    /// Results directory on the remote host
    pub results_dir: String,
    /// Prepended to the photometry command to lower its priority
    pub nice_prefix: String,
    /// Forced photometry at fixed coordinates
    pub photometry_script: String,
    /// Forced photometry of a named solar-system object
    pub object_photometry_script: String,
    /// Renders the preview image for a photometry result
    pub preview_script: String,
    /// Builds the image zip for a photometry result
    pub image_zip_script: String,
    /// Stacks images of a moving object
    pub stack_script: String,
    /// Parallelism passed to the photometry scripts
    pub parallel: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "atlas".to_string(),
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            rsync_program: "rsync".to_string(),
            results_dir: "~/atlasserver/results".to_string(),
            nice_prefix: "nice -n 19 ".to_string(),
            photometry_script: "/atlas/bin/force.sh".to_string(),
            object_photometry_script: "/atlas/bin/ssforce.sh".to_string(),
            preview_script: "~/atlas_gettaskimage.py".to_string(),
            image_zip_script: "~/atlas_gettaskimages.py".to_string(),
            stack_script: "/atlas/bin/stack_rock.sh".to_string(),
            parallel: 8,
        }
    }
}

/// Completion notification settings.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub subject: String,
    /// Prefix for per-job links in the notification body
    pub task_url_base: String,
    /// Total size cap for attached result files
    pub max_attachment_mb: f64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            subject: "ATLAS forced photometry results".to_string(),
            task_url_base: "https://fallingstar-data.com/forcedphot/queue/".to_string(),
            max_attachment_mb: 22.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub num_slots: usize,
    /// Pause between scheduler loop iterations
    pub loop_interval: Duration,
    /// How often a running remote command or copy is checked for cancellation and timeout
    pub poll_interval: Duration,
    /// Runs whose remote command and copies take longer than this are killed and retried
    pub task_max_time: Duration,
    /// Pause before a slot is freed after a retryable failure
    pub retry_pause: Duration,
    pub progress_log_interval: Duration,
    pub maintenance_interval: Duration,
    /// Upper bound on the orphan file scan of one maintenance pass
    pub maintenance_max_time: Duration,
    pub prune_orphan_files: bool,
    pub results_dir: PathBuf,
    pub remote: RemoteConfig,
    pub notify: NotifyConfig,
    pub retention: Vec<RetentionRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_slots: DEFAULT_NUM_SLOTS,
            loop_interval: Duration::from_millis(500),
            poll_interval: Duration::from_secs(1),
            task_max_time: Duration::from_secs(1200),
            retry_pause: Duration::from_secs(5),
            progress_log_interval: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(60 * 60),
            maintenance_max_time: Duration::from_secs(300),
            prune_orphan_files: false,
            results_dir: PathBuf::from("results"),
            remote: RemoteConfig::default(),
            notify: NotifyConfig::default(),
            retention: RetentionRule::defaults(),
        }
    }
}

impl EngineConfig {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_slots(mut self, num_slots: usize) -> Self {
        self.num_slots = num_slots;
        self
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = remote;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_slots == 0 {
            return Err(EngineError::Config("at least one slot is required".into()));
        }
        if self.loop_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(EngineError::Config(
                "loop and poll intervals must be non-zero".into(),
            ));
        }
        if self.task_max_time < self.poll_interval {
            return Err(EngineError::Config(
                "task_max_time must not be shorter than poll_interval".into(),
            ));
        }
        Ok(())
    }
}
