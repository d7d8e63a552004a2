//! Local result files.
//!
//! Every job's artifacts live in one flat directory and are named
//! `job<id>.<ext>` with the id zero-padded to five digits. Image zips are
//! named after the parent photometry job rather than the request itself.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::scheduler::job::{Job, JobId, RequestKind};

pub const DATA_EXT: &str = "txt";
pub const PREVIEW_EXT: &str = "jpg";
pub const PLOT_EXT: &str = "pdf";
pub const ZIP_EXT: &str = "zip";
pub const STACK_EXT: &str = "fits";

const KNOWN_EXTS: [&str; 5] = [DATA_EXT, PREVIEW_EXT, PLOT_EXT, ZIP_EXT, STACK_EXT];

pub fn file_stem(id: JobId) -> String {
    format!("job{:05}", id)
}

pub fn file_name(id: JobId, ext: &str) -> String {
    format!("{}.{}", file_stem(id), ext)
}

/// Extract the job id from a result file name such as `job00042.txt`.
pub fn parse_job_id(name: &str) -> Option<JobId> {
    let (stem, ext) = name.strip_prefix("job")?.split_once('.')?;
    if !KNOWN_EXTS.contains(&ext) || stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Number of data rows in a photometry table. The first non-blank line is the header.
pub async fn count_data_rows(path: &Path) -> Result<usize> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .skip(1)
        .count())
}

#[derive(Debug, Clone)]
pub struct ResultFiles {
    dir: PathBuf,
}

impl ResultFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: JobId, ext: &str) -> PathBuf {
        self.dir.join(file_name(id, ext))
    }

    /// Primary artifact a successful run leaves behind.
    pub fn artifact_path(&self, job: &Job) -> Option<PathBuf> {
        match job.kind {
            RequestKind::PhotometryData => Some(self.path(job.id, DATA_EXT)),
            RequestKind::ImageZip => job.parent_id.map(|parent| self.path(parent, ZIP_EXT)),
            RequestKind::ImageStack => Some(self.path(job.id, STACK_EXT)),
        }
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn job_files(&self, job: &Job) -> Result<Vec<PathBuf>> {
        match (job.kind, job.parent_id) {
            (RequestKind::PhotometryData, _) => Ok(vec![
                self.path(job.id, DATA_EXT),
                self.path(job.id, PREVIEW_EXT),
                self.path(job.id, PLOT_EXT),
            ]),
            (RequestKind::ImageZip, Some(parent)) => Ok(vec![self.path(parent, ZIP_EXT)]),
            _ => self.files_with_stem(job.id).await,
        }
    }

    async fn files_with_stem(&self, id: JobId) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if parse_job_id(name) == Some(id) {
                    found.push(entry.path());
                }
            }
        }
        Ok(found)
    }

    /// Delete whatever files the job produced. Returns the paths actually removed.
    pub async fn remove_job_files(&self, job: &Job) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for path in self.job_files(job).await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::info!(job_id = job.id, path = %path.display(), "Deleted result file");
                    removed.push(path);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(job_id = job.id, path = %path.display(), error = %e, "Error deleting result file");
                }
            }
        }
        Ok(removed)
    }

    /// Remove result files whose job id is not in `known`. Stops early once
    /// `budget` is used up; returns the number of files deleted.
    pub async fn prune_orphans(&self, known: &HashSet<JobId>, budget: Duration) -> Result<usize> {
        let started = Instant::now();
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if started.elapsed() > budget {
                tracing::warn!(removed, "Orphan scan ran out of time, stopping early");
                break;
            }
            let Some(id) = entry.file_name().to_str().and_then(parse_job_id) else {
                continue;
            };
            if known.contains(&id) {
                continue;
            }
            let path = entry.path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Deleted unassociated result file");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Error deleting unassociated file");
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{NewJob, Target};

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(file_name(42, DATA_EXT), "job00042.txt");
        assert_eq!(file_name(123456, ZIP_EXT), "job123456.zip");
    }

    #[test]
    fn parse_job_id_accepts_only_result_files() {
        assert_eq!(parse_job_id("job00042.txt"), Some(42));
        assert_eq!(parse_job_id("job123456.fits"), Some(123456));
        assert_eq!(parse_job_id("job00042.tar"), None);
        assert_eq!(parse_job_id("jobabc.txt"), None);
        assert_eq!(parse_job_id("task00042.txt"), None);
        assert_eq!(parse_job_id("job.txt"), None);
    }

    #[test]
    fn image_zip_artifact_is_named_after_parent() {
        let files = ResultFiles::new("/results");
        let mut new = NewJob::photometry(1, "a", Target::object("ceres"));
        new.kind = RequestKind::ImageZip;
        new.parent_id = Some(5);
        let job = Job::from_new(9, new);
        assert_eq!(
            files.artifact_path(&job),
            Some(PathBuf::from("/results/job00005.zip"))
        );
    }

    #[tokio::test]
    async fn header_only_table_has_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job00001.txt");
        tokio::fs::write(&path, "###MJD m dm\n\n").await.unwrap();
        assert_eq!(count_data_rows(&path).await.unwrap(), 0);

        tokio::fs::write(&path, "###MJD m dm\n60000.1 17.1 0.02\n60001.2 17.3 0.03\n")
            .await
            .unwrap();
        assert_eq!(count_data_rows(&path).await.unwrap(), 2);
    }
}
