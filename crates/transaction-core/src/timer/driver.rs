//! Periodic tick task.
//!
//! The engine itself never sleeps; this task calls
//! [`TransactionManager::on_tick`] every `tick_interval` and sweeps the
//! destination health cache every `blacklist.cleanup_interval`, verifying
//! the timer lists on the same period.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::manager::TransactionManager;

/// Handle of the running tick task. Dropping it aborts the task.
#[derive(Debug)]
pub struct TimerDriver {
    handle: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl TimerDriver {
    /// Spawn the tick task on the current tokio runtime.
    pub fn spawn(manager: TransactionManager) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let tick_period = manager.config().timers.tick_interval;
        let cleanup_period = manager.config().blacklist.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut ticks = time::interval(tick_period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cleanup = time::interval(cleanup_period);
            cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?tick_period, ?cleanup_period, "timer driver started");

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let fired = manager.on_tick();
                        if fired > 0 {
                            debug!(fired, "timers fired");
                        }
                    }
                    _ = cleanup.tick() => {
                        let swept = manager.blacklist().clean_expired(0);
                        let repaired = manager.verify_timers();
                        if repaired > 0 {
                            error!(invariant = "timer_lists_linked", repaired, "timer lists repaired");
                        }
                        if swept > 0 {
                            debug!(swept, "expired blacklist entries removed");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("timer driver stopped");
        });

        Self {
            handle: Some(handle),
            shutdown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "timer driver task failed");
            }
        }
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
