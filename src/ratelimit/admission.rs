//! Composite admission control across several policies.
//!
//! [`AdmissionController::check`] resolves one key per policy at a single
//! timestamp and preflights all of them. Only when every policy passes does
//! it hand out a [`Reservation`]; nothing is paid until the reservation is
//! committed.
//!
//! Between `check` and [`Reservation::commit`] other requests may pay into
//! the same buckets, so a commit can fail right after a successful check.
//! Callers treat that as a late rejection and must not have done anything
//! irreversible before committing.

use std::sync::Arc;

use tracing::debug;

use super::clock::Clock;
use super::limiter::RateLimiter;
use super::policy::PolicyBinding;

/// Outcome of an admission check.
#[derive(Debug)]
pub enum Admission {
    /// Every policy would admit the request; commit to pay for it.
    Admitted(Reservation),
    /// At least one policy rejected the request; nothing was paid.
    Rejected(Rejection),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Which policy turned a request away during preflight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub policy: String,
}

/// A resolved key waiting to be paid.
#[derive(Debug, Clone)]
struct ReservedKey {
    config_key: String,
    key_hash: u64,
    limiter: Arc<RateLimiter>,
}

/// Keys and timestamp captured by a passed preflight.
///
/// Dropping a reservation without committing it pays nothing.
#[derive(Debug)]
#[must_use = "an uncommitted reservation does not pay for the request"]
pub struct Reservation {
    timestamp: f64,
    keys: Vec<ReservedKey>,
}

impl Reservation {
    /// The instant all policies were checked against.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Resolved `(config_key, key_hash)` pairs, in policy order.
    pub fn keys(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.keys
            .iter()
            .map(|k| (k.config_key.as_str(), k.key_hash))
    }

    /// Pay every policy at the reservation timestamp.
    ///
    /// All policies are paid even after one of them rejects. Returns `true`
    /// only if every payment was admitted.
    pub fn commit(self) -> bool {
        let mut ok = true;
        for key in &self.keys {
            if !key.limiter.pay(key.key_hash, self.timestamp) {
                debug!(
                    policy = %key.config_key,
                    key_hash = key.key_hash,
                    "Rate limit tripped despite preflight"
                );
                ok = false;
            }
        }
        ok
    }
}

/// Guards one operation behind an ordered set of policies.
pub struct AdmissionController<C> {
    policies: Vec<PolicyBinding<C>>,
    clock: Arc<dyn Clock>,
}

impl<C> AdmissionController<C> {
    /// Create a controller over `policies`, checked in the given order.
    pub fn new(policies: Vec<PolicyBinding<C>>, clock: Arc<dyn Clock>) -> Self {
        Self { policies, clock }
    }

    pub fn policies(&self) -> &[PolicyBinding<C>] {
        &self.policies
    }

    /// Resolve keys and preflight every policy.
    ///
    /// The timestamp is taken once, before any key is resolved.
    pub async fn check(&self, ctx: &C) -> Admission {
        let timestamp = self.clock.now();

        let mut keys = Vec::with_capacity(self.policies.len());
        for policy in &self.policies {
            keys.push(policy.current_key(ctx).await);
        }

        for (policy, key_hash) in self.policies.iter().zip(&keys) {
            if !policy.preflight_at(*key_hash, timestamp) {
                debug!(
                    policy = %policy.config_key(),
                    key_hash = *key_hash,
                    "Rate limit preflight rejected request"
                );
                return Admission::Rejected(Rejection {
                    policy: policy.config_key().to_string(),
                });
            }
        }

        Admission::Admitted(Reservation {
            timestamp,
            keys: self
                .policies
                .iter()
                .zip(keys)
                .map(|(policy, key_hash)| ReservedKey {
                    config_key: policy.config_key().to_string(),
                    key_hash,
                    limiter: Arc::clone(policy.limiter()),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::key::Key;
    use crate::ratelimit::policy::{KeyExtractor, LimiterRegistry, Policy};
    use async_trait::async_trait;

    struct Probe {
        source: i64,
        target: &'static str,
    }

    struct BySource;

    #[async_trait]
    impl KeyExtractor<Probe> for BySource {
        async fn extract(&self, ctx: &Probe) -> Key {
            Key::Integer(ctx.source)
        }
    }

    struct ByTarget;

    #[async_trait]
    impl KeyExtractor<Probe> for ByTarget {
        async fn extract(&self, ctx: &Probe) -> Key {
            Key::from(ctx.target)
        }
    }

    struct Global;

    #[async_trait]
    impl KeyExtractor<Probe> for Global {
        async fn extract(&self, _ctx: &Probe) -> Key {
            Key::Integer(0)
        }
    }

    struct Fixture {
        clock: ManualClock,
        controller: AdmissionController<Probe>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::new(0.0);
            let mut registry = LimiterRegistry::new(Arc::new(clock.clone()));
            // Single buckets keep the bucket each request lands in predictable.
            let single = PolicyConfig {
                bucket_count: Some(1),
                ..Default::default()
            };
            let source = Policy::new("source", BySource)
                .resolve(Some(&single), &mut registry)
                .unwrap();
            let target = Policy::new("target", ByTarget)
                .resolve(Some(&single), &mut registry)
                .unwrap();
            let controller =
                AdmissionController::new(vec![source, target], registry.clock());
            Self { clock, controller }
        }

        fn limiter(&self, index: usize) -> &Arc<RateLimiter> {
            self.controller.policies()[index].limiter()
        }
    }

    fn probe(source: i64, target: &'static str) -> Probe {
        Probe { source, target }
    }

    fn admitted(admission: Admission) -> Reservation {
        match admission {
            Admission::Admitted(reservation) => reservation,
            Admission::Rejected(rejection) => panic!("rejected by {}", rejection.policy),
        }
    }

    #[tokio::test]
    async fn test_first_request_admitted_and_committed() {
        let fixture = Fixture::new();
        fixture.clock.set(3.0);

        let reservation = admitted(fixture.controller.check(&probe(1, "a")).await);
        assert_eq!(reservation.timestamp(), 3.0);
        let names: Vec<&str> = reservation.keys().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["source", "target"]);

        assert!(reservation.commit());
        assert_eq!(fixture.limiter(0).bucket(0).last_timestamp, Some(3.0));
        assert_eq!(fixture.limiter(1).bucket(0).last_timestamp, Some(3.0));
    }

    #[tokio::test]
    async fn test_check_without_commit_pays_nothing() {
        let fixture = Fixture::new();
        let admission = fixture.controller.check(&probe(1, "a")).await;
        assert!(admission.is_admitted());
        drop(admission);

        assert!(fixture.limiter(0).bucket(0).is_empty());
        assert!(fixture.limiter(1).bucket(0).is_empty());
    }

    #[tokio::test]
    async fn test_failed_preflight_pays_no_policy() {
        let fixture = Fixture::new();
        // Prime only the target limiter so that it rejects the next request.
        fixture.limiter(1).pay(0, 0.0);
        fixture.clock.set(0.1);

        match fixture.controller.check(&probe(1, "a")).await {
            Admission::Rejected(rejection) => assert_eq!(rejection.policy, "target"),
            Admission::Admitted(_) => panic!("expected rejection"),
        }

        // The source policy would have passed but must not be charged.
        assert!(fixture.limiter(0).bucket(0).is_empty());
        assert_eq!(fixture.limiter(1).bucket(0).last_timestamp, Some(0.0));
    }

    #[tokio::test]
    async fn test_commit_does_not_short_circuit() {
        let fixture = Fixture::new();
        let reservation = admitted(fixture.controller.check(&probe(1, "a")).await);

        // A concurrent request pays the source bucket in the race window.
        fixture.limiter(0).pay(0, 0.0);
        fixture.limiter(0).pay(0, 0.0);

        assert!(!reservation.commit());
        // The target policy still observed the attempt.
        assert_eq!(fixture.limiter(1).bucket(0).last_timestamp, Some(0.0));
        assert_eq!(fixture.limiter(0).smoothed_interval(0), Some(0.0));
    }

    #[tokio::test]
    async fn test_race_window_late_rejection() {
        let fixture = Fixture::new();
        fixture.clock.set(10.0);
        let first = admitted(fixture.controller.check(&probe(1, "a")).await);
        let second = admitted(fixture.controller.check(&probe(1, "a")).await);

        assert!(first.commit());
        // Preflight passed for both, but only one can pay for the same instant.
        assert!(!second.commit());
    }

    #[tokio::test]
    async fn test_keys_resolved_at_one_timestamp() {
        let fixture = Fixture::new();
        fixture.clock.set(42.0);
        let reservation = admitted(fixture.controller.check(&probe(5, "b")).await);
        fixture.clock.advance(5.0);

        assert!(reservation.commit());
        assert_eq!(fixture.limiter(0).bucket(0).last_timestamp, Some(42.0));
        assert_eq!(fixture.limiter(1).bucket(0).last_timestamp, Some(42.0));
    }

    #[tokio::test]
    async fn test_well_spaced_requests_keep_passing() {
        let fixture = Fixture::new();
        for i in 0..20 {
            fixture.clock.set(i as f64 * 2.0);
            let reservation = admitted(fixture.controller.check(&probe(1, "a")).await);
            assert!(reservation.commit(), "late rejection at request {}", i);
        }
    }

    #[tokio::test]
    async fn test_global_policy_limits_everyone() {
        let clock = ManualClock::new(0.0);
        let mut registry = LimiterRegistry::new(Arc::new(clock.clone()));
        let source = Policy::new("source", BySource)
            .resolve(None, &mut registry)
            .unwrap();
        let global = Policy::new("global", Global)
            .with_fixed_buckets(1)
            .resolve(None, &mut registry)
            .unwrap();
        let controller = AdmissionController::new(vec![global, source], registry.clock());

        assert!(admitted(controller.check(&probe(1, "a")).await).commit());
        clock.advance(0.1);
        match controller.check(&probe(2, "b")).await {
            Admission::Rejected(rejection) => assert_eq!(rejection.policy, "global"),
            Admission::Admitted(_) => panic!("global limit should apply to all sources"),
        }
    }

    #[tokio::test]
    async fn test_no_policies_always_admits() {
        let controller: AdmissionController<Probe> =
            AdmissionController::new(Vec::new(), Arc::new(ManualClock::new(0.0)));
        let reservation = admitted(controller.check(&probe(1, "a")).await);
        assert_eq!(reservation.keys().count(), 0);
        assert!(reservation.commit());
    }
}
