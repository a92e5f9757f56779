//! Background eviction of idle limiter state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::backend::Sweep;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running sweeper task.
///
/// Dropping the handle aborts the task; [`shutdown`](Self::shutdown) stops it
/// gracefully and waits for it to exit.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Sweep `target` every `every` until the returned handle is shut down or
/// dropped. Must be called from within a tokio runtime.
pub fn spawn_sweeper(target: Arc<dyn Sweep>, every: Duration) -> SweeperHandle {
    let every = every.max(MIN_SWEEP_INTERVAL);
    let (tx, mut rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(interval_ms = every.as_millis() as u64, "Sweeper started");
        loop {
            tokio::select! {
                _ = &mut rx => break,
                _ = ticker.tick() => {
                    let removed = target.sweep();
                    if removed > 0 {
                        debug!(removed, "Sweeper evicted idle entries");
                    }
                }
            }
        }
        info!("Sweeper stopped");
    });

    SweeperHandle {
        shutdown: Some(tx),
        task: Some(task),
    }
}
