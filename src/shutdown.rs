use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Exit status used when a second signal interrupts a graceful stop
const FORCED_EXIT_CODE: i32 = 130;

struct Signals {
    term: Signal,
    int: Signal,
    hup: Signal,
}

impl Signals {
    fn install() -> Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    async fn next(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.hup.recv() => "SIGHUP",
        }
    }
}

/// Cancel the returned token on SIGTERM, SIGINT or SIGHUP.
///
/// Running slot tasks are aborted when the scheduler stops, and their jobs
/// are picked up again on the next start. A second signal while stopping
/// exits the process immediately.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut signals = Signals::install()?;

    let cancel = token.clone();
    tokio::spawn(async move {
        let name = signals.next().await;
        tracing::info!(signal = name, "Stopping the runner");
        cancel.cancel();

        let name = signals.next().await;
        tracing::warn!(signal = name, "Second signal received, exiting now");
        std::process::exit(FORCED_EXIT_CODE);
    });

    Ok(token)
}
