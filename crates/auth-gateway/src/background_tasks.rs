//! Periodic maintenance tasks
//!
//! One interval task sweeps everything that expires: in-memory store
//! entries, revocation entries, PoW challenges, DPoP JTIs, step-up
//! grants and stale per-IP limiters. Redis-backed state expires
//! natively and the sweeps are no-ops there.

use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs the expiry sweeps until cancelled
pub struct SweepRunner {
    state: Arc<AppState>,
    interval: Duration,
}

impl SweepRunner {
    pub fn new(state: Arc<AppState>, interval_seconds: u64) -> Self {
        Self {
            state,
            interval: Duration::from_secs(interval_seconds.max(1)),
        }
    }

    /// Spawn the sweep loop. Returns the token that stops it.
    pub fn start(self) -> CancellationToken {
        let token = CancellationToken::new();
        let child = token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => {
                        info!("Sweep runner stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        });

        token
    }

    async fn sweep(&self) {
        let store = self.state.store.sweep_expired().await;
        let revoked = self.state.revocation.cleanup_expired().await;
        let pow = self.state.pow.cleanup_expired();
        let step_up = self.state.step_up.cleanup_expired();
        let jtis = self
            .state
            .dpop
            .as_ref()
            .map(|d| d.cleanup_expired())
            .unwrap_or(0);
        self.state.ip_limiter.evict_to(10_000);

        debug!(
            store = store,
            revocation = revoked,
            pow = pow,
            step_up = step_up,
            dpop_jtis = jtis,
            "Expiry sweep complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::test_config;

    #[tokio::test]
    async fn test_sweep_runner_starts_and_stops() {
        let state = Arc::new(
            AppState::from_config(test_config(&"a".repeat(32)), None)
                .await
                .unwrap(),
        );

        let token = SweepRunner::new(state, 1).start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    }
}
