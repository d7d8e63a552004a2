use std::path::Path;

use tokio::process::Command;

use crate::config::RemoteConfig;
use crate::worker::executor::ProcessOutput;

/// One scp/rsync invocation between the local results directory and the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub program: String,
    pub args: Vec<String>,
    pub source: String,
    pub dest: String,
    /// A failed required transfer means the run must be retried
    pub required: bool,
}

impl Transfer {
    fn new(program: &str, args: &[&str], source: String, dest: String) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            source,
            dest,
            required: true,
        }
    }

    pub fn scp(remote: &RemoteConfig, source: String, dest: String) -> Self {
        Self::new(&remote.scp_program, &[], source, dest)
    }

    pub fn rsync_copy(remote: &RemoteConfig, source: String, dest: String) -> Self {
        Self::new(&remote.rsync_program, &[], source, dest)
    }

    /// rsync that deletes the source once copied
    pub fn rsync_move(remote: &RemoteConfig, source: String, dest: String) -> Self {
        Self::new(&remote.rsync_program, &["--remove-source-files"], source, dest)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Program name without its directory, for log lines
    pub fn name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.program)
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.args.iter().map(String::as_str));
        parts.push(&self.source);
        parts.push(&self.dest);
        parts.join(" ")
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(&self.source).arg(&self.dest);
        command
    }

    /// Log the copy's output. Returns whether it exited successfully.
    pub fn report(&self, output: &ProcessOutput) -> bool {
        for line in output.stdout.lines() {
            tracing::info!("STDOUT: {line}");
        }
        for line in output.stderr.lines() {
            tracing::warn!("STDERR: {line}");
        }
        let success = output.success();
        if !success {
            tracing::warn!(
                command = %self.command_line(),
                exit_code = ?output.code(),
                required = self.required,
                "Transfer failed"
            );
        }
        success
    }
}
