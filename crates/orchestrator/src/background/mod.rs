//! Background tasks.
//!
//! Each submodule provides a long-running loop that stops when its
//! [`CancellationToken`] is triggered. [`BackgroundTasks`] spawns them
//! together and joins them on shutdown.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::service::Orchestrator;

pub mod retention;
pub mod watchdog;

pub use retention::{RetentionReport, RetentionSweep};
pub use watchdog::{Watchdog, WatchdogFindings};

pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Spawn the retention sweep and the watchdog for `orchestrator`.
    pub fn spawn(orchestrator: &Orchestrator) -> Self {
        let cancel = CancellationToken::new();
        let config = orchestrator.config();

        let retention = RetentionSweep::new(
            orchestrator.registry().clone(),
            orchestrator.dispatcher().clone(),
            config.result_retention,
            config.retention_interval,
        );
        let watchdog = Watchdog::new(
            orchestrator.reconciler().clone(),
            config.stall_threshold,
            config.watchdog_interval,
        );

        let handles = vec![
            ("retention", tokio::spawn(retention.run(cancel.clone()))),
            ("watchdog", tokio::spawn(watchdog.run(cancel.clone()))),
        ];
        Self { cancel, handles }
    }

    /// Signal every task to stop and wait up to `timeout` for each.
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();
        let joins = self.handles.into_iter().map(|(name, handle)| async move {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => tracing::info!(task = name, "Background task stopped"),
                Ok(Err(e)) => tracing::error!(task = name, error = %e, "Background task panicked"),
                Err(_) => tracing::warn!(task = name, "Background task did not stop in time"),
            }
        });
        futures::future::join_all(joins).await;
    }
}
