use crate::reconciler::{ReconciliationLoop, TickOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to a running reconciliation timer. Dropping it leaves the timer running;
/// call [`stop`](Self::stop) to end it.
pub struct TickerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TickerHandle {
    /// Signals the timer to stop and waits for the current tick to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Reconciliation ticker task ended abnormally");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Drives [`ReconciliationLoop::tick`] on a fixed period.
///
/// The first tick fires immediately. Ticks that come due while one is still
/// running are skipped, never queued.
#[must_use]
pub fn spawn_ticker(reconciler: Arc<ReconciliationLoop>, period: Duration) -> TickerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(?period, "Reconciliation ticker started");

        let mut detached = false;
        loop {
            tokio::select! {
                changed = shutdown_rx.changed(), if !detached => match changed {
                    Ok(()) if *shutdown_rx.borrow() => break,
                    Ok(()) => {}
                    Err(_) => {
                        debug!("Ticker handle dropped, ticking until the runtime shuts down");
                        detached = true;
                    }
                },
                _ = interval.tick() => {
                    if let TickOutcome::Aborted { reason } = reconciler.tick().await {
                        warn!(%reason, "Reconciliation tick aborted, retrying next interval");
                    }
                }
            }
        }

        info!("Reconciliation ticker stopped");
    });

    TickerHandle { shutdown_tx, task }
}
