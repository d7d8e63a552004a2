use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::RemoteConfig;
use crate::error::{EngineError, Result};
use crate::results::{self, ResultFiles, DATA_EXT, PREVIEW_EXT, STACK_EXT, ZIP_EXT};
use crate::scheduler::job::{Job, RequestKind, Target};
use crate::worker::transfer::Transfer;

/// Modified Julian Date of the unix epoch
const MJD_UNIX_EPOCH: f64 = 40587.0;

pub fn mjd_now() -> f64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    secs / 86400.0 + MJD_UNIX_EPOCH
}

/// Everything needed to run one job on the remote host.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePlan {
    /// Copied to the remote host before the command runs
    pub upload: Option<Transfer>,
    /// Shell command executed through ssh
    pub command: String,
    /// Copies back to the local results directory; optional ones may fail
    pub downloads: Vec<Transfer>,
    /// Where the primary artifact lands locally
    pub artifact: PathBuf,
}

fn remote_path(remote: &RemoteConfig, name: &str) -> String {
    format!("{}/{}", remote.results_dir.trim_end_matches('/'), name)
}

fn on_host(remote: &RemoteConfig, path: &str) -> String {
    format!("{}:{}", remote.host, path)
}

pub fn plan(job: &Job, remote: &RemoteConfig, files: &ResultFiles, mjd_now: f64) -> Result<RemotePlan> {
    match job.kind {
        RequestKind::PhotometryData => plan_photometry(job, remote, files),
        RequestKind::ImageZip => plan_image_zip(job, remote, files),
        RequestKind::ImageStack => plan_image_stack(job, remote, files, mjd_now),
    }
}

fn plan_photometry(job: &Job, remote: &RemoteConfig, files: &ResultFiles) -> Result<RemotePlan> {
    let remote_result = remote_path(remote, &results::file_name(job.id, DATA_EXT));
    let remote_preview = remote_path(remote, &results::file_name(job.id, PREVIEW_EXT));

    let mut command = remote.nice_prefix.clone();
    match &job.target {
        Target::Object { name } => {
            command.push_str(&format!("{} '{}'", remote.object_photometry_script, name));
        }
        Target::Coordinates { ra, dec, .. } => {
            command.push_str(&format!("{} {} {}", remote.photometry_script, ra, dec));
        }
    }
    if job.use_reduced {
        command.push_str(" red=1");
    }
    if let Target::Coordinates {
        epoch_year,
        pm_ra,
        pm_dec,
        ..
    } = &job.target
    {
        if let Some(epoch) = epoch_year {
            command.push_str(&format!(" epoch={epoch}"));
        }
        if let Some(pm) = pm_ra {
            command.push_str(&format!(" pmra={pm}"));
        }
        if let Some(pm) = pm_dec {
            command.push_str(&format!(" pmdec={pm}"));
        }
    }
    if let Some(m0) = job.mjd_min {
        command.push_str(&format!(" m0={m0}"));
    }
    if let Some(m1) = job.mjd_max {
        command.push_str(&format!(" m1={m1}"));
    }
    command.push_str(&format!(
        " dodb=1 parallel={} | sort -n | tee {remote_result}; {} {remote_result} {}",
        remote.parallel,
        remote.preview_script,
        job.image_flavour()
    ));

    let artifact = files.path(job.id, DATA_EXT);
    Ok(RemotePlan {
        upload: None,
        command,
        downloads: vec![
            // the data file stays on the remote host for later image requests
            Transfer::scp(remote, on_host(remote, &remote_result), artifact.display().to_string()),
            Transfer::rsync_move(
                remote,
                on_host(remote, &remote_preview),
                files.dir().display().to_string(),
            )
            .optional(),
        ],
        artifact,
    })
}

fn plan_image_zip(job: &Job, remote: &RemoteConfig, files: &ResultFiles) -> Result<RemotePlan> {
    let parent = job.parent_id.ok_or_else(|| {
        EngineError::InvalidJob(format!("image request {} has no parent job", job.id))
    })?;
    let remote_data = remote_path(remote, &results::file_name(parent, DATA_EXT));
    let remote_zip = remote_path(remote, &results::file_name(parent, ZIP_EXT));

    let command = format!(
        "{}{} {remote_data} {}",
        remote.nice_prefix,
        remote.image_zip_script,
        job.image_flavour()
    );

    Ok(RemotePlan {
        upload: Some(Transfer::rsync_copy(
            remote,
            files.path(parent, DATA_EXT).display().to_string(),
            on_host(remote, &remote_data),
        )),
        command,
        downloads: vec![Transfer::rsync_move(
            remote,
            on_host(remote, &remote_zip),
            files.dir().display().to_string(),
        )],
        artifact: files.path(parent, ZIP_EXT),
    })
}

fn plan_image_stack(
    job: &Job,
    remote: &RemoteConfig,
    files: &ResultFiles,
    mjd_now: f64,
) -> Result<RemotePlan> {
    let name = job.target.object_name().ok_or_else(|| {
        EngineError::InvalidJob(format!("image stack {} has no object name", job.id))
    })?;
    let task_dir = remote_path(remote, &format!("task{:05}", job.id));
    let remote_log = remote_path(remote, &results::file_name(job.id, DATA_EXT));
    let remote_stack = remote_path(remote, &results::file_name(job.id, STACK_EXT));

    // the stacking script only accepts whole-day bounds
    let command = format!(
        "{}{} '{name}' {:.0} {:.0} outdir={task_dir} | tee {remote_log}; mv {task_dir}/*.fits {remote_stack}; rm -rf {task_dir}",
        remote.nice_prefix,
        remote.stack_script,
        job.mjd_min.unwrap_or(0.0),
        job.mjd_max.unwrap_or(mjd_now),
    );

    let local_dir = files.dir().display().to_string();
    Ok(RemotePlan {
        upload: None,
        command,
        downloads: vec![
            Transfer::rsync_move(remote, on_host(remote, &remote_stack), local_dir.clone()).optional(),
            Transfer::rsync_move(remote, on_host(remote, &remote_log), local_dir),
        ],
        artifact: files.path(job.id, STACK_EXT),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::NewJob;

    fn make_job(id: i64, new: NewJob) -> Job {
        Job::from_new(id, new)
    }

    #[test]
    fn coordinate_photometry_command() {
        let remote = RemoteConfig::default();
        let files = ResultFiles::new("/data/results");
        let mut new = NewJob::photometry(1, "a", Target::coordinates(150.5, -2.25))
            .with_window(Some(59000.0), Some(59100.5))
            .reduced(true);
        if let Target::Coordinates { epoch_year, .. } = &mut new.target {
            *epoch_year = Some(2000.0);
        }
        let plan = plan(&make_job(42, new), &remote, &files, 60000.0).unwrap();

        assert_eq!(
            plan.command,
            "nice -n 19 /atlas/bin/force.sh 150.5 -2.25 red=1 epoch=2000 m0=59000 m1=59100.5 \
             dodb=1 parallel=8 | sort -n | tee ~/atlasserver/results/job00042.txt; \
             ~/atlas_gettaskimage.py ~/atlasserver/results/job00042.txt red"
        );
        assert_eq!(plan.artifact, PathBuf::from("/data/results/job00042.txt"));
        assert!(plan.upload.is_none());
        assert_eq!(plan.downloads.len(), 2);
        assert!(plan.downloads[0].required);
        assert!(!plan.downloads[1].required);
    }

    #[test]
    fn object_photometry_quotes_name() {
        let remote = RemoteConfig::default();
        let files = ResultFiles::new("/r");
        let job = make_job(3, NewJob::photometry(1, "a", Target::object("2019 AB12")));
        let plan = plan(&job, &remote, &files, 60000.0).unwrap();
        assert!(plan
            .command
            .starts_with("nice -n 19 /atlas/bin/ssforce.sh '2019 AB12' dodb=1 parallel=8"));
        assert!(plan.command.ends_with("job00003.txt diff"));
    }

    #[test]
    fn image_zip_uploads_parent_data_first() {
        let remote = RemoteConfig::default();
        let files = ResultFiles::new("/r");
        let mut new = NewJob::photometry(1, "a", Target::coordinates(1.0, 2.0));
        new.kind = RequestKind::ImageZip;
        new.parent_id = Some(17);
        let plan = plan(&make_job(20, new), &remote, &files, 60000.0).unwrap();

        let upload = plan.upload.unwrap();
        assert_eq!(upload.source, "/r/job00017.txt");
        assert_eq!(upload.dest, "atlas:~/atlasserver/results/job00017.txt");
        assert_eq!(
            plan.command,
            "nice -n 19 ~/atlas_gettaskimages.py ~/atlasserver/results/job00017.txt diff"
        );
        assert_eq!(plan.artifact, PathBuf::from("/r/job00017.zip"));
    }

    #[test]
    fn image_stack_rounds_window_and_defaults_max_to_now() {
        let remote = RemoteConfig::default();
        let files = ResultFiles::new("/r");
        let job = make_job(
            8,
            NewJob::image_stack(1, "a", "ceres").with_window(Some(59000.4), None),
        );
        let plan = plan(&job, &remote, &files, 60123.7).unwrap();
        assert_eq!(
            plan.command,
            "nice -n 19 /atlas/bin/stack_rock.sh 'ceres' 59000 60124 \
             outdir=~/atlasserver/results/task00008 | tee ~/atlasserver/results/job00008.txt; \
             mv ~/atlasserver/results/task00008/*.fits ~/atlasserver/results/job00008.fits; \
             rm -rf ~/atlasserver/results/task00008"
        );
        assert_eq!(plan.artifact, PathBuf::from("/r/job00008.fits"));
    }

    #[test]
    fn image_stack_without_object_is_rejected() {
        let remote = RemoteConfig::default();
        let files = ResultFiles::new("/r");
        let mut new = NewJob::photometry(1, "a", Target::coordinates(1.0, 2.0));
        new.kind = RequestKind::ImageStack;
        assert!(plan(&make_job(1, new), &remote, &files, 60000.0).is_err());
    }

    #[test]
    fn mjd_now_is_after_2024() {
        assert!(mjd_now() > 60310.0);
    }
}
