use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub type JobId = i64;
pub type UserId = i64;

/// Characters that would break out of the quoted object name in the remote command.
const FORBIDDEN_NAME_CHARS: [char; 3] = ['\'', '"', ';'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Forced photometry light curve for a target.
    PhotometryData,
    /// Postage-stamp images for the epochs of a finished photometry job.
    ImageZip,
    /// Stacked image of a moving object over a time window.
    ImageStack,
}

impl RequestKind {
    /// Code stored in the `request_type` column.
    pub fn code(&self) -> &'static str {
        match self {
            RequestKind::PhotometryData => "FP",
            RequestKind::ImageZip => "IMGZIP",
            RequestKind::ImageStack => "SSOSTACK",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "FP" => Some(RequestKind::PhotometryData),
            "IMGZIP" => Some(RequestKind::ImageZip),
            "SSOSTACK" => Some(RequestKind::ImageStack),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Lifecycle state derived from the job's timestamps and error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What to measure: a named solar-system object or a fixed sky position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    Object {
        name: String,
    },
    Coordinates {
        ra: f64,
        dec: f64,
        epoch_year: Option<f64>,
        pm_ra: Option<f64>,
        pm_dec: Option<f64>,
    },
}

impl Target {
    pub fn object(name: impl Into<String>) -> Self {
        Target::Object { name: name.into() }
    }

    pub fn coordinates(ra: f64, dec: f64) -> Self {
        Target::Coordinates {
            ra,
            dec,
            epoch_year: None,
            pm_ra: None,
            pm_dec: None,
        }
    }

    pub fn object_name(&self) -> Option<&str> {
        match self {
            Target::Object { name } => Some(name),
            Target::Coordinates { .. } => None,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Target::Object { name } => {
                if name.trim().is_empty() {
                    return Err(EngineError::InvalidJob("object name is empty".into()));
                }
                if name.contains(FORBIDDEN_NAME_CHARS) {
                    return Err(EngineError::InvalidJob(format!(
                        "object name {name:?} contains a quote or semicolon"
                    )));
                }
            }
            Target::Coordinates {
                ra,
                dec,
                epoch_year,
                pm_ra,
                pm_dec,
            } => {
                require_finite("ra", Some(*ra))?;
                require_finite("dec", Some(*dec))?;
                require_finite("radec_epoch_year", *epoch_year)?;
                require_finite("propermotion_ra", *pm_ra)?;
                require_finite("propermotion_dec", *pm_dec)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Object { name } => write!(f, "{name}"),
            Target::Coordinates { ra, dec, .. } => write!(f, "RA {ra} Dec {dec}"),
        }
    }
}

fn require_finite(field: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() => Err(EngineError::InvalidJob(format!(
            "{field} must be a finite number"
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub target: Target,
    pub kind: RequestKind,
    pub parent_id: Option<JobId>,
    pub mjd_min: Option<f64>,
    pub mjd_max: Option<f64>,
    pub use_reduced: bool,
    pub send_email: bool,
    pub from_api: bool,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub queue_position: Option<i32>,
    pub error_msg: Option<String>,
    pub is_archived: bool,
}

impl Job {
    pub(crate) fn from_new(id: JobId, new: NewJob) -> Self {
        Self {
            id,
            user_id: new.user_id,
            username: new.username,
            email: new.email,
            target: new.target,
            kind: new.kind,
            parent_id: new.parent_id,
            mjd_min: new.mjd_min,
            mjd_max: new.mjd_max,
            use_reduced: new.use_reduced,
            send_email: new.send_email,
            from_api: new.from_api,
            comment: new.comment,
            created_at: new.created_at,
            started_at: None,
            finished_at: None,
            queue_position: None,
            error_msg: None,
            is_archived: false,
        }
    }

    pub fn status(&self) -> JobStatus {
        match (self.started_at, self.finished_at, &self.error_msg) {
            (_, Some(_), Some(_)) => JobStatus::Failed,
            (_, Some(_), None) => JobStatus::Succeeded,
            (Some(_), None, _) => JobStatus::Running,
            (None, None, _) => JobStatus::Queued,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Image flavour passed to the remote image scripts.
    pub fn image_flavour(&self) -> &'static str {
        if self.use_reduced {
            "red"
        } else {
            "diff"
        }
    }
}

/// A job as submitted, before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub user_id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub target: Target,
    pub kind: RequestKind,
    pub parent_id: Option<JobId>,
    pub mjd_min: Option<f64>,
    pub mjd_max: Option<f64>,
    pub use_reduced: bool,
    pub send_email: bool,
    pub from_api: bool,
    pub comment: Option<String>,
    /// Jobs submitted together share this timestamp; notifications are batched on it.
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    pub fn photometry(user_id: UserId, username: impl Into<String>, target: Target) -> Self {
        Self {
            user_id,
            username: username.into(),
            email: None,
            target,
            kind: RequestKind::PhotometryData,
            parent_id: None,
            mjd_min: None,
            mjd_max: None,
            use_reduced: false,
            send_email: false,
            from_api: false,
            comment: None,
            created_at: Utc::now(),
        }
    }

    pub fn image_stack(user_id: UserId, username: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::ImageStack,
            ..Self::photometry(user_id, username, Target::object(name))
        }
    }

    /// Follow-up request for a finished, successful photometry job.
    pub fn image_request(parent: &Job, kind: RequestKind) -> Result<Self> {
        if parent.status() != JobStatus::Succeeded {
            return Err(EngineError::InvalidJob(format!(
                "parent job {} has not finished successfully",
                parent.id
            )));
        }
        Ok(Self {
            user_id: parent.user_id,
            username: parent.username.clone(),
            email: parent.email.clone(),
            target: parent.target.clone(),
            kind,
            parent_id: Some(parent.id),
            mjd_min: parent.mjd_min,
            mjd_max: parent.mjd_max,
            use_reduced: parent.use_reduced,
            send_email: false,
            from_api: false,
            comment: parent.comment.clone(),
            created_at: Utc::now(),
        })
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_window(mut self, mjd_min: Option<f64>, mjd_max: Option<f64>) -> Self {
        self.mjd_min = mjd_min;
        self.mjd_max = mjd_max;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn reduced(mut self, use_reduced: bool) -> Self {
        self.use_reduced = use_reduced;
        self
    }

    pub fn notify(mut self, send_email: bool) -> Self {
        self.send_email = send_email;
        self
    }

    pub fn from_api(mut self, from_api: bool) -> Self {
        self.from_api = from_api;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.target.validate()?;
        require_finite("mjd_min", self.mjd_min)?;
        require_finite("mjd_max", self.mjd_max)?;
        if let (Some(min), Some(max)) = (self.mjd_min, self.mjd_max) {
            if max <= min {
                return Err(EngineError::InvalidJob(
                    "mjd_max must be greater than mjd_min".into(),
                ));
            }
        }

        match self.kind {
            RequestKind::PhotometryData if self.parent_id.is_some() => Err(
                EngineError::InvalidJob("photometry jobs cannot have a parent".into()),
            ),
            RequestKind::ImageZip if self.parent_id.is_none() => Err(EngineError::InvalidJob(
                "image requests need a parent photometry job".into(),
            )),
            RequestKind::ImageStack if self.target.object_name().is_none() => Err(
                EngineError::InvalidJob("image stacks need an object name".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Partial update applied by the store. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    /// Only applied when the job has no start stamp yet.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
    pub clear_position: bool,
    pub archived: Option<bool>,
}

impl JobUpdate {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn finished(at: DateTime<Utc>, error_msg: Option<String>) -> Self {
        Self {
            finished_at: Some(at),
            error_msg,
            clear_position: true,
            ..Default::default()
        }
    }

    pub fn archived() -> Self {
        Self {
            archived: Some(true),
            ..Default::default()
        }
    }

    pub fn apply(&self, job: &mut Job) {
        if job.started_at.is_none() {
            job.started_at = self.started_at;
        }
        if let Some(at) = self.finished_at {
            job.finished_at = Some(at);
        }
        if let Some(msg) = &self.error_msg {
            job.error_msg = Some(msg.clone());
        }
        if self.clear_position {
            job.queue_position = None;
        }
        if let Some(archived) = self.archived {
            job.is_archived = archived;
        }
    }
}
