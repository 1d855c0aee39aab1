//! Core rate limiter implementation.
//!
//! Each bucket tracks an exponential moving average of the interval between
//! paid observations. A request is admitted while that average stays at or
//! above `1 / max_requests_per_second`.

use parking_lot::Mutex;
use tracing::trace;

use super::bucket::{Bucket, BucketStore};
use crate::error::{ProbeGuardError, Result};

/// Default admission threshold in requests per second.
pub const DEFAULT_MAX_REQUESTS_PER_SECOND: f64 = 1.0;
/// Default cap on a single observed gap, in seconds.
pub const DEFAULT_GAP_CEILING: f64 = 60.0;
/// Default weight on the smoothed history.
pub const DEFAULT_SMOOTHING_WEIGHT: f64 = 0.9;
/// Default number of buckets.
pub const DEFAULT_BUCKET_COUNT: usize = 256;

/// Validated parameters for a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterParams {
    max_requests_per_second: f64,
    gap_ceiling: f64,
    smoothing_weight: f64,
    bucket_count: usize,
}

impl LimiterParams {
    /// Validate and build limiter parameters.
    ///
    /// Out-of-range values are rejected rather than clamped.
    pub fn new(
        max_requests_per_second: f64,
        gap_ceiling: f64,
        smoothing_weight: f64,
        bucket_count: usize,
    ) -> Result<Self> {
        let invalid = ProbeGuardError::InvalidParams;

        if !max_requests_per_second.is_finite() || max_requests_per_second <= 0.0 {
            return Err(invalid(format!(
                "max_requests_per_second must be positive, got {}",
                max_requests_per_second
            )));
        }
        if gap_ceiling.is_nan() || gap_ceiling <= 0.0 {
            return Err(invalid(format!(
                "gap_ceiling must be positive, got {}",
                gap_ceiling
            )));
        }
        if !(0.0..1.0).contains(&smoothing_weight) {
            return Err(invalid(format!(
                "smoothing_weight must be in [0, 1), got {}",
                smoothing_weight
            )));
        }
        if bucket_count == 0 {
            return Err(invalid("bucket_count must be positive".to_string()));
        }

        Ok(Self {
            max_requests_per_second,
            gap_ceiling,
            smoothing_weight,
            bucket_count,
        })
    }

    pub fn max_requests_per_second(&self) -> f64 {
        self.max_requests_per_second
    }

    pub fn gap_ceiling(&self) -> f64 {
        self.gap_ceiling
    }

    pub fn smoothing_weight(&self) -> f64 {
        self.smoothing_weight
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Smallest smoothed interval that is still admitted.
    pub fn min_interval(&self) -> f64 {
        1.0 / self.max_requests_per_second
    }
}

impl Default for LimiterParams {
    fn default() -> Self {
        Self {
            max_requests_per_second: DEFAULT_MAX_REQUESTS_PER_SECOND,
            gap_ceiling: DEFAULT_GAP_CEILING,
            smoothing_weight: DEFAULT_SMOOTHING_WEIGHT,
            bucket_count: DEFAULT_BUCKET_COUNT,
        }
    }
}

/// Result of folding one observation into a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Advance {
    prior_timestamp: f64,
    prior_smoothed: Option<f64>,
    smoothed: f64,
}

/// An approximate per-key rate estimator over a fixed bucket table.
///
/// This struct is thread-safe and can be shared across multiple tasks. A
/// single `pay` is one locked read-modify-write; nothing holds the lock
/// between a `preflight` and the matching `pay`.
#[derive(Debug)]
pub struct RateLimiter {
    params: LimiterParams,
    min_interval: f64,
    store: Mutex<BucketStore>,
}

impl RateLimiter {
    /// Create a limiter with its own empty bucket store.
    pub fn new(params: LimiterParams) -> Self {
        Self {
            params,
            min_interval: params.min_interval(),
            store: Mutex::new(BucketStore::new(params.bucket_count())),
        }
    }

    /// The parameters this limiter was built with.
    pub fn params(&self) -> &LimiterParams {
        &self.params
    }

    /// Check whether an observation at `timestamp` would be admitted.
    ///
    /// Never writes to the bucket table.
    pub fn preflight(&self, key_hash: u64, timestamp: f64) -> bool {
        let store = self.store.lock();
        let bucket = store.get(store.index(key_hash));
        self.admits(self.advance(&bucket, timestamp))
    }

    /// Record an observation at `timestamp` and report whether it is admitted.
    ///
    /// The bucket is updated even when the observation is rejected, so a
    /// flooding sender keeps lowering its own smoothed interval.
    pub fn pay(&self, key_hash: u64, timestamp: f64) -> bool {
        let advance = {
            let mut store = self.store.lock();
            let index = store.index(key_hash);
            let bucket = store.get(index);
            let advance = self.advance(&bucket, timestamp);
            store.set(
                index,
                Bucket {
                    last_timestamp: Some(timestamp),
                    smoothed_interval: advance.map(|a| a.smoothed).or(bucket.smoothed_interval),
                },
            );
            advance
        };

        let admitted = self.admits(advance);
        trace!(
            key_hash = key_hash,
            timestamp = timestamp,
            prior_timestamp = ?advance.map(|a| a.prior_timestamp),
            prior_smoothed = ?advance.and_then(|a| a.prior_smoothed),
            smoothed = ?advance.map(|a| a.smoothed),
            admitted = admitted,
            "Paid rate limit observation"
        );
        admitted
    }

    /// Current smoothed interval of the bucket `key_hash` maps to.
    pub fn smoothed_interval(&self, key_hash: u64) -> Option<f64> {
        self.bucket(key_hash).smoothed_interval
    }

    /// Snapshot of the bucket `key_hash` maps to.
    pub fn bucket(&self, key_hash: u64) -> Bucket {
        let store = self.store.lock();
        store.get(store.index(key_hash))
    }

    /// The slot `key_hash` maps to.
    pub fn bucket_index(&self, key_hash: u64) -> usize {
        self.store.lock().index(key_hash)
    }

    fn advance(&self, bucket: &Bucket, timestamp: f64) -> Option<Advance> {
        let prior_timestamp = bucket.last_timestamp?;
        // Timestamps are non-decreasing per instance; a clock step backwards
        // counts as a zero gap.
        let raw = (timestamp - prior_timestamp).clamp(0.0, self.params.gap_ceiling);
        let smoothed = match bucket.smoothed_interval {
            None => raw,
            Some(prior) => {
                let w = self.params.smoothing_weight;
                w * prior + (1.0 - w) * raw
            }
        };
        Some(Advance {
            prior_timestamp,
            prior_smoothed: bucket.smoothed_interval,
            smoothed,
        })
    }

    fn admits(&self, advance: Option<Advance>) -> bool {
        match advance {
            None => true,
            Some(a) => a.smoothed >= self.min_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_rps: f64, gap_ceiling: f64, weight: f64, buckets: usize) -> RateLimiter {
        RateLimiter::new(LimiterParams::new(max_rps, gap_ceiling, weight, buckets).unwrap())
    }

    fn assert_close(actual: Option<f64>, expected: f64) {
        let actual = actual.expect("smoothed interval should be set");
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_default_params() {
        let params = LimiterParams::default();
        assert_eq!(params.max_requests_per_second(), 1.0);
        assert_eq!(params.gap_ceiling(), 60.0);
        assert_eq!(params.smoothing_weight(), 0.9);
        assert_eq!(params.bucket_count(), 256);
        assert_eq!(params.min_interval(), 1.0);
    }

    #[test]
    fn test_params_reject_out_of_range() {
        assert!(LimiterParams::new(0.0, 60.0, 0.9, 1).is_err());
        assert!(LimiterParams::new(-1.0, 60.0, 0.9, 1).is_err());
        assert!(LimiterParams::new(f64::NAN, 60.0, 0.9, 1).is_err());
        assert!(LimiterParams::new(1.0, 0.0, 0.9, 1).is_err());
        assert!(LimiterParams::new(1.0, 60.0, 1.0, 1).is_err());
        assert!(LimiterParams::new(1.0, 60.0, -0.1, 1).is_err());
        assert!(LimiterParams::new(1.0, 60.0, 0.9, 0).is_err());
        assert!(LimiterParams::new(1.0, 60.0, 0.0, 1).is_ok());
    }

    #[test]
    fn test_params_error_without_policy() {
        let err = LimiterParams::new(1.0, 60.0, 0.9, 0).unwrap_err();
        assert!(matches!(err, ProbeGuardError::InvalidParams(_)));
        assert_eq!(
            err.to_string(),
            "Invalid rate limiter parameters: bucket_count must be positive"
        );
    }

    #[test]
    fn test_first_observation_is_admitted() {
        // Even an absurdly strict rate lets the first request through.
        let limiter = limiter(1e-6, 60.0, 0.9, 4);
        assert!(limiter.preflight(1, 0.0));
        assert!(limiter.pay(1, 0.0));
        assert_eq!(limiter.bucket(1).last_timestamp, Some(0.0));
        assert_eq!(limiter.smoothed_interval(1), None);
    }

    #[test]
    fn test_preflight_does_not_mutate() {
        let limiter = limiter(1.0, 60.0, 0.9, 4);
        limiter.pay(7, 0.0);
        let before = limiter.bucket(7);

        let results: Vec<bool> = (0..10).map(|_| limiter.preflight(7, 0.1)).collect();
        assert!(results.iter().all(|r| *r == results[0]));
        assert!(!results[0]);
        assert_eq!(limiter.bucket(7), before);
    }

    #[test]
    fn test_pay_advances_state_each_call() {
        let limiter = limiter(1.0, 60.0, 0.9, 4);
        limiter.pay(2, 0.0);
        limiter.pay(2, 5.0);
        assert_close(limiter.smoothed_interval(2), 5.0);

        limiter.pay(2, 5.0);
        assert_close(limiter.smoothed_interval(2), 4.5);
        assert_eq!(limiter.bucket(2).last_timestamp, Some(5.0));
    }

    #[test]
    fn test_example_trace() {
        let limiter = limiter(1.0, 60.0, 0.9, 1);
        assert!(limiter.pay(0, 0.0));

        assert!(!limiter.pay(0, 0.1));
        assert_close(limiter.smoothed_interval(0), 0.1);

        assert!(!limiter.pay(0, 1.1));
        assert_close(limiter.smoothed_interval(0), 0.19);
    }

    #[test]
    fn test_sustained_slow_rate_always_admitted() {
        let limiter = limiter(1.0, 60.0, 0.9, 16);
        for i in 0..500 {
            let t = i as f64 * 1.25;
            assert!(limiter.pay(42, t), "rejected at observation {}", i);
        }
    }

    #[test]
    fn test_sustained_fast_rate_converges_to_rejection() {
        let limiter = limiter(1.0, 60.0, 0.9, 16);
        // A long idle gap first, so the bucket starts far above the threshold.
        assert!(limiter.pay(9, 0.0));
        assert!(limiter.pay(9, 60.0));

        let results: Vec<bool> = (1..300)
            .map(|i| limiter.pay(9, 60.0 + i as f64 * 0.5))
            .collect();

        let first_reject = results
            .iter()
            .position(|admitted| !admitted)
            .expect("fast sender should eventually be rejected");
        assert!(first_reject > 0);
        assert!(results[first_reject..].iter().all(|admitted| !admitted));
        assert!(limiter.smoothed_interval(9).unwrap() < 1.0);
    }

    #[test]
    fn test_rejected_pay_still_writes_through() {
        let limiter = limiter(1.0, 60.0, 0.9, 1);
        limiter.pay(0, 0.0);
        assert!(!limiter.pay(0, 0.1));
        assert!(!limiter.pay(0, 0.2));
        assert_eq!(limiter.bucket(0).last_timestamp, Some(0.2));
        assert_close(limiter.smoothed_interval(0), 0.1);
    }

    #[test]
    fn test_gap_is_clipped_at_ceiling() {
        let clipped = limiter(1.0, 60.0, 0.9, 1);
        let exact = limiter(1.0, 60.0, 0.9, 1);

        clipped.pay(0, 0.0);
        exact.pay(0, 0.0);
        clipped.pay(0, 600.0);
        exact.pay(0, 60.0);
        assert_eq!(clipped.smoothed_interval(0), exact.smoothed_interval(0));

        clipped.pay(0, 1200.0);
        exact.pay(0, 120.0);
        assert_eq!(clipped.smoothed_interval(0), exact.smoothed_interval(0));
    }

    #[test]
    fn test_slow_recovery_after_burst() {
        let limiter = limiter(1.0, 60.0, 0.9, 1);
        limiter.pay(0, 0.0);
        limiter.pay(0, 0.1);

        // Well-spaced requests at exactly 2s still need several rounds to lift
        // the average back over 1s.
        let mut t = 0.1;
        let mut rejected = 0;
        while !limiter.pay(0, t + 2.0) {
            t += 2.0;
            rejected += 1;
            assert!(rejected < 100);
        }
        assert!(rejected >= 3);
    }

    #[test]
    fn test_colliding_keys_throttle_each_other() {
        let limiter = limiter(1.0, 60.0, 0.9, 4);
        assert_eq!(limiter.bucket_index(1), limiter.bucket_index(5));

        assert!(limiter.pay(1, 0.0));
        // Key 5 has never been seen but shares key 1's bucket.
        assert!(!limiter.preflight(5, 0.1));
        assert!(!limiter.pay(5, 0.1));

        // A key in another bucket is unaffected.
        assert!(limiter.pay(2, 0.1));
    }

    #[test]
    fn test_backwards_timestamp_counts_as_zero_gap() {
        let limiter = limiter(1.0, 60.0, 0.5, 1);
        limiter.pay(0, 10.0);
        assert!(!limiter.pay(0, 9.0));
        assert_eq!(limiter.smoothed_interval(0), Some(0.0));
    }
}
