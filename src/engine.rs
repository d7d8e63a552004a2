use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::maintenance::Sweeper;
use crate::notify::Notifier;
use crate::scheduler::Scheduler;
use crate::store::JobStore;

/// Wires the scheduler, the maintenance sweeper and the status server together.
pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<dyn JobStore>,
    pub notifier: Arc<dyn Notifier>,
    pub status_addr: Option<SocketAddr>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        status_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            config,
            store,
            notifier,
            status_addr,
        }
    }

    /// Run every subsystem until `shutdown` fires.
    ///
    /// 1. Spawns the maintenance sweeper (first pass runs immediately)
    /// 2. Optionally spawns the status server
    /// 3. Runs the scheduler loop on the current task
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the scheduler loop
    /// hits a store error. Background tasks are stopped before returning.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;
        tokio::fs::create_dir_all(&self.config.results_dir).await?;

        tracing::info!(
            slots = self.config.num_slots,
            host = %self.config.remote.host,
            results_dir = %self.config.results_dir.display(),
            "Starting forced photometry runner"
        );

        // background tasks stop on this child token even when the scheduler fails
        let background = shutdown.child_token();

        let sweeper = Sweeper::new(&self.config, self.store.clone()).spawn(background.clone());

        let scheduler = Scheduler::new(&self.config, self.store.clone(), self.notifier.clone());

        let status = self.status_addr.map(|addr| {
            let state = DashboardState {
                store: self.store.clone(),
                slots: scheduler.slots(),
            };
            tokio::spawn(run_dashboard(addr, state, background.clone()))
        });

        let result = scheduler.run(shutdown).await;

        background.cancel();
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "Maintenance task ended abnormally");
        }
        if let Some(status) = status {
            if let Err(e) = status.await {
                tracing::warn!(error = %e, "Status server ended abnormally");
            }
        }

        result
    }
}
