//! Fixed-size, hash-indexed bucket storage.
//!
//! Every key maps to `hash % len` and all keys landing in the same slot share
//! one `Bucket`. There is no chaining: colliding keys throttle each other.

/// Rate state for one slot of a [`BucketStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bucket {
    /// Timestamp of the most recent paid observation
    pub last_timestamp: Option<f64>,
    /// Smoothed inter-arrival interval in seconds
    pub smoothed_interval: Option<f64>,
}

impl Bucket {
    /// Whether this bucket has never been paid into.
    pub fn is_empty(&self) -> bool {
        self.last_timestamp.is_none()
    }
}

/// A flat array of buckets addressed by key hash.
#[derive(Debug, Clone)]
pub struct BucketStore {
    buckets: Box<[Bucket]>,
}

impl BucketStore {
    /// Create a store with `bucket_count` empty buckets.
    ///
    /// `bucket_count` must be non-zero; [`super::LimiterParams`] guarantees it.
    pub fn new(bucket_count: usize) -> Self {
        Self {
            buckets: vec![Bucket::default(); bucket_count].into_boxed_slice(),
        }
    }

    /// Map a key hash onto a slot.
    pub fn index(&self, key_hash: u64) -> usize {
        (key_hash % self.buckets.len() as u64) as usize
    }

    /// Read a bucket by slot.
    pub fn get(&self, index: usize) -> Bucket {
        self.buckets[index]
    }

    /// Overwrite a bucket by slot.
    pub fn set(&mut self, index: usize, bucket: Bucket) {
        self.buckets[index] = bucket;
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Always false for a constructed store.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
