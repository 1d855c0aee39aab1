//! Adaptive rate limiting and admission control.

mod admission;
mod bucket;
mod clock;
mod key;
mod limiter;
mod policy;

pub use admission::{Admission, AdmissionController, Rejection, Reservation};
pub use bucket::{Bucket, BucketStore};
#[cfg(test)]
pub(crate) use clock::ManualClock;
pub use clock::{Clock, MonotonicClock};
pub use key::Key;
pub use limiter::{
    LimiterParams, RateLimiter, DEFAULT_BUCKET_COUNT, DEFAULT_GAP_CEILING,
    DEFAULT_MAX_REQUESTS_PER_SECOND, DEFAULT_SMOOTHING_WEIGHT,
};
pub use policy::{KeyExtractor, LimiterRegistry, Policy, PolicyBinding};
