//! [`Sweeper`] – the recurring background pass.
//!
//! Every tick runs [`ControlPlane::sweep`]: in-flight actions older than
//! their type's threshold are timed out and stale devices are reclassified
//! offline.  A failing pass is logged and retried on the next tick; it never
//! stops the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::control_plane::{ControlPlane, SweepReport};

pub struct Sweeper {
    plane: Arc<ControlPlane>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(plane: Arc<ControlPlane>, interval: Duration) -> Self {
        Self {
            plane,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Run one pass.  Returns `None` if it failed.
    pub fn tick(&self) -> Option<SweepReport> {
        match self.plane.sweep() {
            Ok(report) => {
                if !report.timed_out.is_empty() || !report.presence.is_empty() {
                    info!(
                        timed_out = report.timed_out.len(),
                        presence_changes = report.presence.len(),
                        "sweep pass"
                    );
                }
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "sweep failed; retrying next tick");
                None
            }
        }
    }

    /// Run on the current Tokio runtime until the handle is shut down.
    pub fn spawn(self) -> SweeperHandle {
        let running = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(Notify::new());
        let task = {
            let running = Arc::clone(&running);
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                debug!(interval_ms = self.interval.as_millis() as u64, "sweeper started");
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            self.tick();
                        }
                        _ = stop.notified() => break,
                    }
                }
                running.store(false, Ordering::SeqCst);
                debug!("sweeper stopped");
            })
        };
        SweeperHandle {
            running,
            stop,
            task,
        }
    }
}

pub struct SweeperHandle {
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the loop and wait for the current pass to finish.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        if let Err(e) = self.task.await {
            warn!(error = %e, "sweeper task ended abnormally");
        }
    }
}
