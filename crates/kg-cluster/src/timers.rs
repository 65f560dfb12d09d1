//! Cancellable timers. `ClusterWorker::run` holds no spawned task for its
//! waits - dropping the future cancels the outstanding sleep with nothing
//! left orphaned.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

#[async_trait]
pub trait Timers: Send + Sync {
    async fn sleep(&self, duration: Duration);
    fn jitter(&self, min: Duration, max: Duration) -> Duration;
}

/// Real wall-clock timers used outside tests.
pub struct RealTimers<R> {
    rng: Mutex<R>,
}

impl<R: rand::RngCore + Send> RealTimers<R> {
    pub fn new(rng: R) -> Self {
        Self { rng: Mutex::new(rng) }
    }
}

#[async_trait]
impl<R: rand::RngCore + Send> Timers for RealTimers<R> {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn jitter(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let span_ms = (max - min).as_millis() as u64;
        let offset_ms = self.rng.lock().gen_range(0..=span_ms);
        min + Duration::from_millis(offset_ms)
    }
}

/// Deterministic no-delay timers for unit tests - `jitter` still picks a
/// value in range (using a thread-local RNG) but `sleep` resolves instantly.
#[derive(Clone, Copy)]
pub struct InstantTimers;

#[async_trait]
impl Timers for InstantTimers {
    async fn sleep(&self, _duration: Duration) {}

    fn jitter(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            min
        } else {
            let span_ms = (max - min).as_millis() as u64;
            min + Duration::from_millis(rand::thread_rng().gen_range(0..=span_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        let t = InstantTimers;
        for _ in 0..50 {
            let d = t.jitter(Duration::from_millis(30_000), Duration::from_millis(90_000));
            assert!(d >= Duration::from_millis(30_000));
            assert!(d <= Duration::from_millis(90_000));
        }
    }

    #[test]
    fn jitter_degenerate_range_returns_min() {
        let t = InstantTimers;
        let d = t.jitter(Duration::from_millis(100), Duration::from_millis(50));
        assert_eq!(d, Duration::from_millis(100));
    }
}
