use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::{shutdown_channel, OrderAction, Reconciler, Shutdown, ShutdownTrigger};

/// Handle to the running reconciliation task. Dropping it stops the task
/// without waiting for it.
#[derive(Debug)]
pub struct ReconcileHandle {
    stop: ShutdownTrigger,
    join: JoinHandle<()>,
}

impl ReconcileHandle {
    /// Signal the task and wait until it and its deferred re-checks exit.
    pub async fn stop(self) {
        self.stop.trigger();
        if let Err(e) = self.join.await {
            error!(error = %e, "reconcile task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Reconciler {
    /// Spawn the tick loop. It runs until `shutdown` fires or the returned
    /// handle is stopped or dropped.
    pub fn start(self, shutdown: Shutdown) -> ReconcileHandle {
        let (stop, local) = shutdown_channel();
        let join = tokio::spawn(self.run(shutdown, local));
        ReconcileHandle { stop, join }
    }

    async fn run(self, mut external: Shutdown, local: Shutdown) {
        let mut stop = local.clone();
        let mut ticker = tokio::time::interval(self.config().poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deferred: JoinSet<()> = JoinSet::new();

        info!(
            interval_secs = self.config().poll_interval.as_secs(),
            max_in_flight = self.config().max_in_flight,
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = external.wait() => break,
                _ = stop.wait() => break,
                Some(res) = deferred.join_next(), if !deferred.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            error!(error = %e, "deferred re-check panicked");
                        }
                    }
                }
                _ = ticker.tick() => {
                    let report = tokio::select! {
                        _ = external.wait() => break,
                        _ = stop.wait() => break,
                        report = self.run_tick() => report,
                    };
                    for (number, after) in report.deferrals() {
                        self.schedule_recheck(&mut deferred, number, after, local.clone())
                            .await;
                    }
                }
            }
        }

        // Aborts sleeping re-checks; they hold no locks across awaits.
        // Aborted tasks never release their slot, so a restarted clone
        // would otherwise skip those orders forever.
        deferred.shutdown().await;
        self.clear_rechecks().await;
        info!("reconciler stopped");
    }

    async fn schedule_recheck(
        &self,
        set: &mut JoinSet<()>,
        number: &str,
        after: Duration,
        shutdown: Shutdown,
    ) {
        if !self.claim_recheck(number).await {
            debug!(order = %number, "re-check already pending");
            return;
        }
        debug!(order = %number, after_secs = after.as_secs(), "deferred re-check scheduled");
        set.spawn(self.clone().recheck_after(number.to_string(), after, shutdown));
    }

    /// Sleep, re-check, and keep deferring while the authority answers 429.
    async fn recheck_after(self, number: String, mut after: Duration, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(after) => {}
            }
            let action = tokio::select! {
                _ = shutdown.wait() => break,
                action = self.recheck(&number) => action,
            };
            match action {
                OrderAction::Deferred { after_secs } => {
                    after = Duration::from_secs(after_secs);
                }
                other => {
                    debug!(order = %number, action = ?other, "deferred re-check done");
                    break;
                }
            }
        }
        self.release_recheck(&number).await;
    }
}
