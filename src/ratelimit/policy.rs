//! Policy bindings: named limiter configurations tied to a key extractor.
//!
//! A [`Policy`] is a static description (config key, how to derive the key
//! from a request, bucket sizing). Resolving it against a service instance's
//! [`LimiterRegistry`] produces a [`PolicyBinding`] that owns a handle to its
//! own [`RateLimiter`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::key::Key;
use super::limiter::{LimiterParams, RateLimiter, DEFAULT_BUCKET_COUNT};
use crate::config::PolicyConfig;
use crate::error::{ProbeGuardError, Result};

/// Derives the rate limit key for a request context.
///
/// Extraction may suspend, e.g. to read request content.
#[async_trait]
pub trait KeyExtractor<C>: Send + Sync {
    /// Produce the key for `ctx`.
    async fn extract(&self, ctx: &C) -> Key;
}

/// Instance-scoped table of rate limiters keyed by policy config key.
///
/// Each running service instance (and each test) builds its own registry, so
/// limiter state is never shared implicitly.
pub struct LimiterRegistry {
    limiters: HashMap<String, Arc<RateLimiter>>,
    clock: Arc<dyn Clock>,
    hasher: ahash::RandomState,
}

impl LimiterRegistry {
    /// Create an empty registry reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            limiters: HashMap::new(),
            clock,
            hasher: ahash::RandomState::new(),
        }
    }

    /// Create and register a limiter under `config_key`.
    ///
    /// Registering the same config key twice is a configuration error.
    pub fn register(
        &mut self,
        config_key: &str,
        params: LimiterParams,
    ) -> Result<Arc<RateLimiter>> {
        if self.limiters.contains_key(config_key) {
            return Err(ProbeGuardError::Config(format!(
                "rate limit policy '{}' is already registered",
                config_key
            )));
        }

        let limiter = Arc::new(RateLimiter::new(params));
        self.limiters
            .insert(config_key.to_string(), Arc::clone(&limiter));

        debug!(
            policy = config_key,
            max_requests_per_second = params.max_requests_per_second(),
            gap_ceiling = params.gap_ceiling(),
            smoothing_weight = params.smoothing_weight(),
            bucket_count = params.bucket_count(),
            "Registered rate limiter"
        );
        Ok(limiter)
    }

    /// Look up the limiter registered under `config_key`.
    pub fn get(&self, config_key: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(config_key).cloned()
    }

    /// The clock shared by everything resolved against this registry.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Get the number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

/// An unresolved rate limit policy.
pub struct Policy<C> {
    config_key: String,
    extractor: Arc<dyn KeyExtractor<C>>,
    fixed_buckets: Option<usize>,
    default_buckets: usize,
}

impl<C> Policy<C> {
    /// Create a policy read from the `config_key` configuration table.
    pub fn new<E>(config_key: impl Into<String>, extractor: E) -> Self
    where
        E: KeyExtractor<C> + 'static,
    {
        Self {
            config_key: config_key.into(),
            extractor: Arc::new(extractor),
            fixed_buckets: None,
            default_buckets: DEFAULT_BUCKET_COUNT,
        }
    }

    /// Pin the bucket count, ignoring any configured `bucket_count`.
    ///
    /// Global limits use a single bucket.
    pub fn with_fixed_buckets(mut self, buckets: usize) -> Self {
        self.fixed_buckets = Some(buckets);
        self
    }

    /// Bucket count used when the configuration does not set one.
    pub fn with_default_buckets(mut self, buckets: usize) -> Self {
        self.default_buckets = buckets;
        self
    }

    pub fn config_key(&self) -> &str {
        &self.config_key
    }

    /// Validate `config`, build a limiter for it and register it.
    ///
    /// A missing configuration table means all defaults.
    pub fn resolve(
        &self,
        config: Option<&PolicyConfig>,
        registry: &mut LimiterRegistry,
    ) -> Result<PolicyBinding<C>> {
        let config = config.cloned().unwrap_or_default();

        let bucket_count = match self.fixed_buckets {
            Some(fixed) => {
                if config.bucket_count.is_some_and(|n| n != fixed) {
                    warn!(
                        policy = %self.config_key,
                        fixed_buckets = fixed,
                        "Ignoring configured bucket_count for fixed-size policy"
                    );
                }
                fixed
            }
            None => config.bucket_count.unwrap_or(self.default_buckets),
        };

        let params = config
            .params(bucket_count)
            .map_err(|e| match e {
                ProbeGuardError::InvalidParams(reason) => ProbeGuardError::InvalidPolicy {
                    policy: self.config_key.clone(),
                    reason,
                },
                other => other,
            })?;

        let limiter = registry.register(&self.config_key, params)?;
        Ok(PolicyBinding {
            config_key: self.config_key.clone(),
            extractor: Arc::clone(&self.extractor),
            limiter,
            clock: registry.clock(),
            hasher: registry.hasher.clone(),
        })
    }
}

/// A policy resolved against one service instance.
pub struct PolicyBinding<C> {
    config_key: String,
    extractor: Arc<dyn KeyExtractor<C>>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    hasher: ahash::RandomState,
}

impl<C> Clone for PolicyBinding<C> {
    fn clone(&self) -> Self {
        Self {
            config_key: self.config_key.clone(),
            extractor: Arc::clone(&self.extractor),
            limiter: Arc::clone(&self.limiter),
            clock: Arc::clone(&self.clock),
            hasher: self.hasher.clone(),
        }
    }
}

impl<C> PolicyBinding<C> {
    pub fn config_key(&self) -> &str {
        &self.config_key
    }

    /// The limiter backing this binding.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Extract the key for `ctx` and hash it.
    pub async fn current_key(&self, ctx: &C) -> u64 {
        let key = self.extractor.extract(ctx).await;
        let key_hash = self.hash_key(&key);
        trace!(
            policy = %self.config_key,
            key = %key,
            key_hash = key_hash,
            "Resolved rate limit key"
        );
        key_hash
    }

    /// Hash a key the same way [`Self::current_key`] does.
    pub fn hash_key(&self, key: &Key) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Non-mutating admission check at the current time.
    pub fn preflight(&self, key_hash: u64) -> bool {
        self.preflight_at(key_hash, self.clock.now())
    }

    /// Record an observation at the current time.
    pub fn pay(&self, key_hash: u64) -> bool {
        self.pay_at(key_hash, self.clock.now())
    }

    pub fn preflight_at(&self, key_hash: u64, timestamp: f64) -> bool {
        self.limiter.preflight(key_hash, timestamp)
    }

    pub fn pay_at(&self, key_hash: u64, timestamp: f64) -> bool {
        self.limiter.pay(key_hash, timestamp)
    }
}
