//! Periodic sweep driver
//!
//! Calls [`CloudPool::sweep`] on a fixed interval until a shutdown future
//! resolves. A sweep that is running when shutdown fires is allowed to finish.

use crate::pool::CloudPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Default time between two sweeps
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Owns the sweep timer of one pool
pub struct SweepDriver {
    pool: Arc<CloudPool>,
    interval: Duration,
}

impl SweepDriver {
    pub fn new(pool: Arc<CloudPool>, interval: Duration) -> Self {
        Self { pool, interval }
    }

    /// Sweep until `shutdown` resolves. Returns the number of sweeps run.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> usize {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            pool = %self.pool.account().name,
            interval_secs = self.interval.as_secs_f64(),
            "Sweep driver started"
        );

        let mut sweeps = 0;
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!(pool = %self.pool.account().name, sweeps, "Sweep driver stopping");
                    break;
                }

                _ = ticker.tick() => {
                    match self.pool.sweep().await {
                        Some(_) => sweeps += 1,
                        None => debug!("Previous sweep still running"),
                    }
                }
            }
        }

        sweeps
    }

    /// Run on a background task
    pub fn spawn<S>(self, shutdown: S) -> JoinHandle<usize>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::CloudAccount;
    use crate::agent::AgentState;
    use crate::lifecycle::LifecycleEngine;
    use crate::pool::PoolSettings;
    use crate::retry::RetryPolicy;
    use crate::template::TemplateConfig;
    use crate::testing::{ManualClock, MockConnector, MockProvider};
    use stratus_core::Credentials;
    use tokio::sync::oneshot;

    fn pool() -> Arc<CloudPool> {
        let engine = LifecycleEngine::new(
            Arc::new(MockProvider::new()),
            Arc::new(MockConnector::new()),
            Arc::new(ManualClock::new()),
        )
        .with_retry(RetryPolicy::no_retry());
        let account = Arc::new(CloudAccount::new("ci", Credentials::default()));
        let mut pool = CloudPool::new(account, engine, PoolSettings::default());
        let template = TemplateConfig::new("small", "ubuntu-22.04", "fsn1", "cx22")
            .with_keep_around_minutes(5)
            .resolve()
            .unwrap();
        pool.add_template(template).unwrap();
        Arc::new(pool)
    }

    #[tokio::test]
    async fn test_driver_sweeps_until_shutdown() {
        let pool = pool();
        let handles = pool.provision("small", 2).await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let task = SweepDriver::new(Arc::clone(&pool), Duration::from_millis(10)).spawn(async move {
            let _ = rx.await;
        });

        for handle in &handles {
            let reached = tokio::time::timeout(
                Duration::from_secs(5),
                handle.wait_until(|s| s == AgentState::Ready),
            )
            .await
            .unwrap();
            assert_eq!(reached, AgentState::Ready);
        }

        tx.send(()).unwrap();
        let sweeps = task.await.unwrap();
        assert!(sweeps >= 1);
    }

    #[tokio::test]
    async fn test_resolved_shutdown_runs_no_sweep() {
        let pool = pool();
        pool.provision("small", 1).await.unwrap();

        let sweeps = SweepDriver::new(Arc::clone(&pool), Duration::from_millis(10))
            .run(async {})
            .await;

        assert_eq!(sweeps, 0);
        assert_eq!(pool.handles().await[0].state(), AgentState::Requested);
    }
}
