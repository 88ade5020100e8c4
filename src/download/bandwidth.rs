//! Global bandwidth shaping with a shared token bucket.
//!
//! Every segment fetcher of every task draws from one [`BandwidthLimiter`]
//! before accepting a network chunk, so the aggregate rate stays under the
//! configured limit no matter how many fetchers run.
//!
//! Consumers reserve tokens up front and may drive the bucket into debt;
//! each then sleeps for exactly its share of the deficit. Nobody spins.
//!
//! # Example
//!
//! ```
//! use splitfetch_core::download::BandwidthLimiter;
//!
//! # async fn example() {
//! let limiter = BandwidthLimiter::new(Some(512 * 1024));
//! limiter.acquire(64 * 1024).await;
//! limiter.set_rate(None).await; // lift the limit
//! # }
//! ```

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

/// Burst allowance, as a fraction of one second of traffic.
const BURST_DIVISOR: f64 = 10.0;

/// Shared token bucket; `rate` of `None` means unlimited.
#[derive(Debug)]
pub struct BandwidthLimiter {
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    rate: Option<u64>,
    capacity: f64,
    /// May go negative while consumers sleep off a reservation.
    tokens: f64,
    last_refill: Instant,
}

#[allow(clippy::cast_precision_loss)]
fn capacity_for(rate: Option<u64>) -> f64 {
    rate.map_or(0.0, |r| (r as f64 / BURST_DIVISOR).max(1.0))
}

impl Bucket {
    #[allow(clippy::cast_precision_loss)]
    fn refill(&mut self, now: Instant) {
        if let Some(rate) = self.rate {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate as f64).min(self.capacity);
        }
        self.last_refill = now;
    }
}

impl BandwidthLimiter {
    /// Creates a limiter; `None` or `Some(0)` disables shaping.
    #[must_use]
    pub fn new(bytes_per_second: Option<u64>) -> Self {
        let rate = bytes_per_second.filter(|r| *r > 0);
        let capacity = capacity_for(rate);
        Self {
            bucket: Mutex::new(Bucket {
                rate,
                capacity,
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Current limit in bytes per second, `None` when unlimited.
    pub async fn rate(&self) -> Option<u64> {
        self.bucket.lock().await.rate
    }

    /// Changes the limit; takes effect for the next reservation.
    #[instrument(skip(self))]
    pub async fn set_rate(&self, bytes_per_second: Option<u64>) {
        let rate = bytes_per_second.filter(|r| *r > 0);
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        bucket.rate = rate;
        bucket.capacity = capacity_for(rate);
        if rate.is_none() {
            bucket.tokens = 0.0;
        } else {
            bucket.tokens = bucket.tokens.min(bucket.capacity);
        }
        debug!(rate = ?rate, "bandwidth limit changed");
    }

    /// Reserves `amount` bytes and waits until they fit under the rate.
    #[allow(clippy::cast_precision_loss)]
    pub async fn acquire(&self, amount: u64) {
        if amount == 0 {
            return;
        }

        let wait = {
            let mut bucket = self.bucket.lock().await;
            let Some(rate) = bucket.rate else {
                return;
            };
            bucket.refill(Instant::now());
            bucket.tokens -= amount as f64;
            if bucket.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.tokens / rate as f64)
            }
        };

        if !wait.is_zero() {
            trace!(amount, wait_ms = wait.as_millis(), "waiting for bandwidth");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = BandwidthLimiter::new(None);
        let start = std::time::Instant::now();
        for _ in 0..1000 {
            limiter.acquire(1024 * 1024).await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_rate_means_unlimited() {
        let limiter = BandwidthLimiter::new(Some(0));
        assert_eq!(limiter.rate().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_consumer_paced_to_rate() {
        let limiter = BandwidthLimiter::new(Some(100_000));
        let start = Instant::now();
        for _ in 0..20 {
            limiter.acquire(10_000).await;
        }
        let elapsed = start.elapsed();
        // 200 KB at 100 KB/s, minus the initial 10 KB burst.
        assert!(elapsed >= Duration::from_millis(1800), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_consumers_share_the_rate() {
        let limiter = Arc::new(BandwidthLimiter::new(Some(100_000)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    limiter.acquire(10_000).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let elapsed = start.elapsed();
        // 400 KB in aggregate at 100 KB/s.
        assert!(elapsed >= Duration::from_millis(3800), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(4200), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate_applies_to_next_reservation() {
        let limiter = BandwidthLimiter::new(Some(1_000));
        limiter.set_rate(None).await;
        let start = Instant::now();
        limiter.acquire(1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.set_rate(Some(1_000_000)).await;
        assert_eq!(limiter.rate().await, Some(1_000_000));
    }
}
