//! Remote execution of jobs.
//!
//! Jobs run on the photometry host over ssh; their artifacts are copied back
//! into the local results directory with scp/rsync.
//!
//! # Components
//!
//! - [`command`]: builds the remote shell command and transfer plan per request kind
//! - [`transfer`]: describes one scp/rsync copy and reports its output
//! - [`RemoteExecutor`]: runs a plan, watching for cancellation and the time limit
//!
//! # Execution Flow
//!
//! 1. Image requests first upload the parent's data table
//! 2. [`RemoteExecutor::execute`] runs `ssh <host> <command>`
//! 3. Every poll interval the job record is checked; if it is gone, ssh is killed
//! 4. Results are copied back under the same polling and time limit, and the
//!    primary artifact is inspected
//! 5. Returns an [`ExecutionResult`]: completed, failed, or retry later

pub mod command;
pub mod executor;
pub mod transfer;

pub use executor::{ExecutionResult, RemoteExecutor, RetryReason};
