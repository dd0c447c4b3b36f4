//! Periodic maintenance tasks with an explicit start/stop lifecycle.
//!
//! Each long-lived in-memory map (rate-limit visitors, online-device cache)
//! and each expiry sweep owns one `Reaper`. Nothing is spawned until
//! `start` is called, and `stop` waits for the task to finish.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Running {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Reaper {
    name: &'static str,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Reaper {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the periodic task on the current tokio runtime. A second call
    /// while running is a no-op.
    pub fn start<F, Fut>(&self, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!(reaper = self.name, "reaper already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let name = self.name;
        let period = self.interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first pass
            // runs one full period after start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        debug!(reaper = name, "running maintenance pass");
                        task().await;
                    }
                }
            }
            debug!(reaper = name, "reaper loop exited");
        });

        info!(reaper = self.name, interval_ms = period.as_millis() as u64, "reaper started");
        *running = Some(Running { shutdown, handle });
    }

    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { shutdown, handle }) = running {
            let _ = shutdown.send(());
            if let Err(e) = handle.await {
                warn!(reaper = self.name, error = %e, "reaper task ended abnormally");
            }
            info!(reaper = self.name, "reaper stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(Running { handle, .. }) = self.running.get_mut().take() {
            handle.abort();
        }
    }
}
