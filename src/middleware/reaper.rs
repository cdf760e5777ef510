//! Background eviction of idle rate-limit visitors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::middleware::rate_limit::VisitorRegistry;

/// A running sweep task. Dropping it cancels the task without waiting.
pub struct Reaper {
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Spawns a task that sweeps `registry` every `every` until `shutdown`
    /// fires. Must be called inside a tokio runtime.
    pub fn spawn(registry: Arc<VisitorRegistry>, every: Duration, shutdown: CancellationToken) -> Self {
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            info!(interval_secs = every.as_secs_f64(), ttl_secs = registry.ttl().as_secs(), "reaper started");

            let mut ticks = interval(every.max(Duration::from_millis(1)));
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let evicted = registry.sweep(Instant::now());
                        if evicted > 0 {
                            debug!(evicted, remaining = registry.len(), "idle visitors evicted");
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }

            info!("reaper stopped");
        });

        Self { shutdown, handle: Some(handle) }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancels the task and waits for it to exit.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    fn registry(ttl: Duration) -> Arc<VisitorRegistry> {
        Arc::new(VisitorRegistry::new(&RateLimitConfig { ttl, ..RateLimitConfig::default() }))
    }

    #[tokio::test]
    async fn idle_visitors_are_evicted() {
        let registry = registry(Duration::from_millis(20));
        registry.check("10.0.0.1|/app/login", Instant::now());

        let reaper = Reaper::spawn(Arc::clone(&registry), Duration::from_millis(10), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!registry.contains("10.0.0.1|/app/login"));
        reaper.stop().await;
    }

    #[tokio::test]
    async fn active_visitors_survive_a_sweep() {
        let registry = registry(Duration::from_secs(60));
        registry.check("10.0.0.2|/app/routes", Instant::now());

        let reaper = Reaper::spawn(Arc::clone(&registry), Duration::from_millis(5), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(registry.contains("10.0.0.2|/app/routes"));
        reaper.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_the_task() {
        let token = CancellationToken::new();
        let reaper = Reaper::spawn(registry(Duration::from_secs(1)), Duration::from_secs(3600), token.clone());
        assert!(reaper.is_running());

        reaper.stop().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn external_cancellation_ends_the_task() {
        let token = CancellationToken::new();
        let reaper = Reaper::spawn(registry(Duration::from_secs(1)), Duration::from_secs(3600), token.clone());

        token.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reaper.is_running());
    }

    #[tokio::test]
    async fn drop_cancels() {
        let token = CancellationToken::new();
        drop(Reaper::spawn(registry(Duration::from_secs(1)), Duration::from_secs(3600), token.clone()));
        assert!(token.is_cancelled());
    }
}
