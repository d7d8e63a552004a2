//! Test harness for runner integration tests.
//!
//! Stands in for the remote host with shell scripts in a temp directory:
//! `ssh` runs the command locally, `scp`/`rsync` strip the `host:` prefix and
//! copy, and the photometry tooling writes small canned outputs.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use forcephot_runner::config::{EngineConfig, RemoteConfig};
use forcephot_runner::error::Result;
use forcephot_runner::notify::{Notification, Notifier};
use forcephot_runner::scheduler::{Job, JobUpdate, NewJob, Scheduler, Target};
use forcephot_runner::store::{JobStore, MemoryJobStore};

pub const HEADER: &str = "###MJD m dm uJy duJy F err chi/N RA Dec x y maj min phi apfit mag5sig Sky Obs";

/// Photometry output with two data rows, deliberately out of order
pub const PHOTOMETRY_OK: &str = r####"echo "59001.5 17.42 0.03 401 11 o 0 1.1"
echo "###MJD m dm uJy duJy F err chi/N RA Dec x y maj min phi apfit mag5sig Sky Obs"
echo "59000.5 17.40 0.03 405 11 c 0 1.0"
"####;

/// Photometry output with a header and nothing else
pub const PHOTOMETRY_EMPTY: &str = r####"echo "###MJD m dm uJy duJy F err chi/N RA Dec x y maj min phi apfit mag5sig Sky Obs"
"####;

/// Photometry that never finishes within a test's time limit
pub const PHOTOMETRY_SLOW: &str = "sleep 5\n";

pub const STACK_OK: &str = r#"for arg in "$@"; do
  case "$arg" in
    outdir=*) out="${arg#outdir=}" ;;
  esac
done
mkdir -p "$out"
echo "stacking $1 from $2 to $3"
echo "SIMPLE = T" > "$out/stack_$1.fits"
"#;

pub const STACK_NO_IMAGES: &str = r#"echo "No images found for $1 between $2 and $3"
"#;

/// scp that hangs before copying anything
pub const SCP_STALLED: &str = "sleep 6\nsrc=\"${1#*:}\"\nexec cp \"$src\" \"$2\"\n";

/// rsync that delivers its file and then hangs
pub const RSYNC_STALLS_AFTER_COPY: &str = r#"move=0
if [ "$1" = "--remove-source-files" ]; then move=1; shift; fi
src="${1#*:}"
cp "$src" "${2#*:}" || exit 23
if [ "$move" = 1 ]; then rm -f "$src"; fi
sleep 6
"#;

/// Fake remote host rooted in a temp directory.
pub struct FakeRemote {
    pub root: TempDir,
    /// Local results directory
    pub local: PathBuf,
    /// Results directory on the "remote host"
    pub remote: PathBuf,
    bin: PathBuf,
}

impl FakeRemote {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let local = root.path().join("results");
        let remote = root.path().join("remote");
        let bin = root.path().join("bin");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::create_dir_all(&bin).unwrap();

        let fake = Self {
            root,
            local,
            remote,
            bin,
        };
        fake.set_script("ssh", "shift\nexec sh -c \"$1\"\n");
        fake.set_script("scp", "src=\"${1#*:}\"\nexec cp \"$src\" \"$2\"\n");
        fake.set_script(
            "rsync",
            r#"move=0
if [ "$1" = "--remove-source-files" ]; then move=1; shift; fi
src="${1#*:}"
dest="${2#*:}"
cp "$src" "$dest" || exit 23
if [ "$move" = 1 ]; then rm -f "$src"; fi
"#,
        );
        fake.set_photometry(PHOTOMETRY_OK);
        fake.set_script("preview", "echo preview > \"${1%.txt}.jpg\"\n");
        fake.set_script("imagezip", "echo \"$2\" > \"${1%.txt}.zip\"\n");
        fake.set_script("stack", STACK_OK);
        fake
    }

    pub fn script_path(&self, name: &str) -> PathBuf {
        self.bin.join(name)
    }

    /// Write an executable `/bin/sh` script under the fake bin directory.
    pub fn set_script(&self, name: &str, body: &str) {
        let path = self.script_path(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Both photometry scripts (coordinates and named object) run `body`.
    pub fn set_photometry(&self, body: &str) {
        self.set_script("force", body);
        self.set_script("ssforce", body);
    }

    /// Make ssh fail the way it does when the host is unreachable.
    pub fn set_unreachable(&self) {
        self.set_script("ssh", "echo 'ssh: connect to host atlas port 22: No route to host' >&2\nexit 255\n");
    }

    fn program(&self, name: &str) -> String {
        self.script_path(name).display().to_string()
    }

    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            host: "atlas".to_string(),
            ssh_program: self.program("ssh"),
            scp_program: self.program("scp"),
            rsync_program: self.program("rsync"),
            results_dir: self.remote.display().to_string(),
            nice_prefix: String::new(),
            photometry_script: self.program("force"),
            object_photometry_script: self.program("ssforce"),
            preview_script: self.program("preview"),
            image_zip_script: self.program("imagezip"),
            stack_script: self.program("stack"),
            parallel: 2,
        }
    }

    /// Engine configuration with short intervals suitable for tests
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            loop_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(50),
            task_max_time: Duration::from_secs(10),
            retry_pause: Duration::from_millis(10),
            progress_log_interval: Duration::from_secs(1),
            ..EngineConfig::new(&self.local)
        }
        .with_remote(self.remote_config())
    }

    pub fn local_file(&self, name: &str) -> PathBuf {
        self.local.join(name)
    }

    pub fn remote_file(&self, name: &str) -> PathBuf {
        self.remote.join(name)
    }
}

/// Records every notification instead of delivering it.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Collects formatted log output on the current thread while its guard is alive.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// =============================================================================
// Job factories
// =============================================================================

pub fn coords_job(user_id: i64) -> NewJob {
    NewJob::photometry(user_id, format!("user{user_id}"), Target::coordinates(150.0, 2.5))
}

pub fn object_job(user_id: i64, name: &str) -> NewJob {
    NewJob::photometry(user_id, format!("user{user_id}"), Target::object(name))
}

pub async fn insert(store: &MemoryJobStore, new: NewJob) -> Job {
    store.insert(new).await.unwrap()
}

/// Insert a job and mark it finished at `finished_at`.
pub async fn insert_finished(
    store: &MemoryJobStore,
    new: NewJob,
    finished_at: DateTime<Utc>,
    error_msg: Option<&str>,
) -> Job {
    let job = store.insert(new).await.unwrap();
    store
        .update(job.id, JobUpdate::started(finished_at))
        .await
        .unwrap();
    store
        .update(job.id, JobUpdate::finished(finished_at, error_msg.map(str::to_string)))
        .await
        .unwrap();
    store.get(job.id).await.unwrap().unwrap()
}

/// Write a result file with some content into `dir`.
pub fn touch(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("{HEADER}\n59000.5 17.40 0.03\n")).unwrap();
    path
}

pub fn new_scheduler(
    fake: &FakeRemote,
    store: Arc<MemoryJobStore>,
    notifier: Arc<RecordingNotifier>,
    num_slots: usize,
) -> Scheduler {
    let config = fake.engine_config().with_slots(num_slots);
    Scheduler::new(&config, store, notifier)
}

/// Tick the scheduler until no job is queued or running and every slot is idle.
/// Returns false on timeout.
pub async fn drain(scheduler: &mut Scheduler, store: &MemoryJobStore, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        scheduler.tick().await.unwrap();
        let idle = {
            let slots = scheduler.slots();
            let slots = slots.read().await;
            slots.free_slots() == slots.num_slots()
        };
        if idle && store.list_unfinished().await.unwrap().is_empty() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn assert_eventually<F, Fut>(check: F, timeout: Duration, msg: &str)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Timed out waiting for: {msg}");
}
