use crate::services::gc::GarbageCollector;
use crate::utils::keyed_mutex::KeyedMutex;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

pub struct BackgroundWorker {
    gc: GarbageCollector,
    locks: KeyedMutex,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(
        gc: GarbageCollector,
        locks: KeyedMutex,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            gc,
            locks,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "🚀 Background worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Background worker shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.perform_cleanup().await;
                }
            }
        }
    }

    pub async fn perform_cleanup(&self) {
        tracing::info!("🧹 Running staging cleanup...");

        match self.gc.sweep_expired().await {
            Ok(report) => tracing::info!(
                removed = report.directories_removed,
                sessions = report.sessions_removed,
                "✅ Staging cleanup completed"
            ),
            Err(e) => tracing::error!("Staging cleanup failed: {}", e),
        }

        let before = self.locks.len();
        self.locks.cleanup();
        tracing::debug!("Dropped {} idle session locks", before.saturating_sub(self.locks.len()));
    }
}
