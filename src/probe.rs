//! Connectivity probe.
//!
//! "Online" means the backend answered a minimal read within the probe
//! timeout. Any error or timeout counts as offline; the probe never fails.

use std::sync::Arc;
use std::time::Duration;

use crate::remote::RemoteService;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectivityProbe<R: RemoteService> {
    remote: Arc<R>,
    timeout: Duration,
}

impl<R: RemoteService> ConnectivityProbe<R> {
    pub fn new(remote: Arc<R>, timeout: Duration) -> Self {
        Self { remote, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check whether the backend is reachable right now.
    pub async fn is_online(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.remote.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Connectivity probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Connectivity probe timed out"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;

    #[tokio::test]
    async fn test_online() {
        let remote = Arc::new(FakeRemote::new());
        let probe = ConnectivityProbe::new(remote.clone(), DEFAULT_PROBE_TIMEOUT);

        assert!(probe.is_online().await);
        assert_eq!(remote.probe_calls(), 1);
    }

    #[tokio::test]
    async fn test_offline() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_online(false);
        let probe = ConnectivityProbe::new(remote, DEFAULT_PROBE_TIMEOUT);

        assert!(!probe.is_online().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_counts_as_offline() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_probe_delay(Some(Duration::from_secs(60)));
        let probe = ConnectivityProbe::new(remote, Duration::from_millis(500));

        assert!(!probe.is_online().await);
    }
}
