use crate::services::session_store::UploadSessionStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

/// Periodically drops idle resumable uploads so abandoned temp files do not
/// pile up between requests.
pub struct SessionSweeper {
    store: Arc<UploadSessionStore>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl SessionSweeper {
    pub fn new(
        store: Arc<UploadSessionStore>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Session sweeper started (every {:?})", self.interval);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Session sweeper shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.sweep().await;
                }
            }
        }
    }

    pub async fn sweep(&self) -> usize {
        let expired = self.store.expire_stale(Utc::now()).await;
        if expired > 0 {
            tracing::info!("🧹 Expired {} idle uploads, {} still live", expired, self.store.len());
        } else {
            tracing::debug!("No idle uploads to expire");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;

    #[tokio::test]
    async fn test_sweep_expires_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let config = UploadConfig {
            upload_valid_duration: 0,
            ..UploadConfig::enabled_in(dir.path())
        };
        let store = Arc::new(UploadSessionStore::new(&config));
        store.open("idle", 10).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let sweeper = SessionSweeper::new(store.clone(), Duration::from_secs(60), rx);
        sleep(Duration::from_millis(5)).await;

        assert_eq!(sweeper.sweep().await, 1);
        assert!(store.is_empty());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(UploadSessionStore::new(&UploadConfig::enabled_in(dir.path())));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(SessionSweeper::new(store, Duration::from_secs(3600), rx).run());
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
