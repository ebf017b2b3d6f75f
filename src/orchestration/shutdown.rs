//! Termination signal handling for replicas.

/// Exit status used when a replica is stopped by a signal.
pub const TERMINATED_EXIT_CODE: i32 = 15;

/// SIGTERM or Ctrl+C exits the process immediately. In-flight work is dropped; the next attempt
/// re-derives it from the manifest, the completion markers and the output ledger.
pub fn install_termination_handlers() {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, exiting");
            std::process::exit(TERMINATED_EXIT_CODE);
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                if sigterm.recv().await.is_some() {
                    tracing::warn!("received SIGTERM, exiting");
                    std::process::exit(TERMINATED_EXIT_CODE);
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    });
}
