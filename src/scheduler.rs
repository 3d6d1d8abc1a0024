//! Background drain loop.
//!
//! [`AutoSync`] owns at most one tokio task that calls
//! [`Reconciler::tick`] every interval. The first tick happens one interval
//! after start. Stopping cancels future ticks but lets a tick that is already
//! running finish.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{MousyError, MousyResult};
use crate::reconcile::Reconciler;
use crate::remote::RemoteService;

pub const DEFAULT_AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(30);

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct AutoSync<R: RemoteService> {
    reconciler: Arc<Reconciler<R>>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl<R: RemoteService> AutoSync<R> {
    pub fn new(reconciler: Arc<Reconciler<R>>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn state(&self) -> MutexGuard<'_, Option<Running>> {
        // The guarded value stays consistent even if a holder panicked
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the loop. Returns false if it was already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> MousyResult<bool> {
        let mut state = self.state();
        if matches!(state.as_ref(), Some(running) if !running.handle.is_finished()) {
            return Ok(false);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MousyError::Other(format!("Auto-sync needs a tokio runtime: {}", e)))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let reconciler = self.reconciler.clone();
        let period = self.interval;

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => reconciler.tick().await,
                }
            }
            tracing::debug!("Auto-sync loop exited");
        });

        *state = Some(Running { cancel, handle });
        tracing::info!(interval_secs = period.as_secs(), "Auto-sync started");
        Ok(true)
    }

    /// Stop the loop. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        match self.state().take() {
            Some(running) => {
                running.cancel.cancel();
                tracing::info!("Auto-sync stopped");
                true
            }
            None => false,
        }
    }

    /// Stop the loop and wait for an in-flight tick to finish.
    pub async fn shutdown(&self) {
        let running = self.state().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                tracing::warn!(error = %e, "Auto-sync task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state().as_ref(), Some(running) if !running.handle.is_finished())
    }
}

impl<R: RemoteService> Drop for AutoSync<R> {
    fn drop(&mut self) {
        if let Some(running) = self.state().take() {
            running.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncOptions;
    use crate::database::Database;
    use crate::testing::FakeRemote;

    const PERIOD: Duration = Duration::from_secs(30);

    fn auto_sync() -> (Arc<FakeRemote>, AutoSync<FakeRemote>) {
        let remote = Arc::new(FakeRemote::new());
        let db = Arc::new(std::sync::Mutex::new(Database::new_in_memory().unwrap()));
        let reconciler = Arc::new(Reconciler::new(remote.clone(), db, &SyncOptions::default()));
        (remote, AutoSync::new(reconciler, PERIOD))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (remote, auto_sync) = auto_sync();

        assert!(auto_sync.start().unwrap());
        assert!(!auto_sync.start().unwrap());
        assert!(auto_sync.is_running());

        tokio::time::sleep(PERIOD * 3 + Duration::from_millis(1)).await;
        // one loop, one probe per tick
        assert_eq!(remote.probe_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_interval() {
        let (remote, auto_sync) = auto_sync();
        auto_sync.start().unwrap();

        tokio::time::sleep(PERIOD - Duration::from_millis(1)).await;
        assert_eq!(remote.probe_calls(), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(remote.probe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_future_ticks() {
        let (remote, auto_sync) = auto_sync();
        auto_sync.start().unwrap();

        tokio::time::sleep(PERIOD * 2 + Duration::from_millis(1)).await;
        assert_eq!(remote.probe_calls(), 2);

        assert!(auto_sync.stop());
        assert!(!auto_sync.is_running());

        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(remote.probe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle() {
        let (_remote, auto_sync) = auto_sync();
        assert!(!auto_sync.stop());
        assert!(!auto_sync.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let (remote, auto_sync) = auto_sync();
        auto_sync.start().unwrap();
        auto_sync.stop();

        assert!(auto_sync.start().unwrap());
        tokio::time::sleep(PERIOD + Duration::from_millis(1)).await;
        assert_eq!(remote.probe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_running_tick_finish() {
        let (remote, auto_sync) = auto_sync();
        remote.set_probe_delay(Some(Duration::from_secs(1)));
        auto_sync.start().unwrap();

        // mid-probe of the first tick
        tokio::time::sleep(PERIOD + Duration::from_millis(500)).await;
        assert_eq!(remote.probe_calls(), 1);

        auto_sync.shutdown().await;
        assert!(!auto_sync.is_running());
        assert_eq!(remote.probe_calls(), 1);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let (_remote, auto_sync) = auto_sync();
        assert!(auto_sync.start().is_err());
        assert!(!auto_sync.is_running());
    }
}
