//! Reconciliation primitives for the runner pool.
//!
//! The runner manager converges each runner group's live population toward
//! its desired count. This crate holds the pure, synchronous parts of that
//! loop so they can be tested without a runtime:
//!
//! - **Deficit**: how many workers a group is missing.
//! - **Backoff**: how long a group that keeps failing to provision should be
//!   left alone before the next attempt.
//!
//! # Invariants
//!
//! - A deficit is never negative; surplus workers are never reclaimed here.
//! - Backoff state is keyed by group name and only grows on provisioning
//!   failures; any successful run clears it.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;

/// Number of workers to launch for a group with `desired` target and `live`
/// workers currently registered.
///
/// Groups at or above their target yield zero.
pub fn deficit(desired: u32, live: usize) -> usize {
    (desired as usize).saturating_sub(live)
}

/// Desired-vs-live snapshot for one group, used in pass summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupObservation {
    /// Desired worker count from configuration.
    pub desired: u32,

    /// Workers currently present in the registry for this group.
    pub live: usize,
}

impl GroupObservation {
    /// Workers missing from this group.
    pub fn deficit(&self) -> usize {
        deficit(self.desired, self.live)
    }

    /// True if the group has more workers than it wants.
    pub fn is_over_target(&self) -> bool {
        self.live > self.desired as usize
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,

    /// Upper bound for any single delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never delays. Useful for tests.
    pub fn disabled() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay for the given zero-based attempt.
    ///
    /// The jittered result never exceeds `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        if base_ms <= 0.0 || max_ms <= 0.0 {
            return Duration::ZERO;
        }

        let exp = 2.0_f64.powi(attempt.min(32) as i32);
        let delay = (base_ms * exp).min(max_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let spread = delay * jitter;
            let offset = rand::rng().random_range(-spread..=spread);
            (delay + offset).clamp(0.0, max_ms)
        } else {
            delay
        };

        Duration::from_millis(delay as u64)
    }
}

#[derive(Debug, Clone)]
struct FailureStreak {
    consecutive: u32,
    retry_at: Instant,
}

/// Per-group provisioning backoff.
///
/// Records consecutive provisioning failures per group and answers whether a
/// group may be provisioned right now.
#[derive(Debug, Clone)]
pub struct GroupBackoff {
    policy: BackoffPolicy,
    streaks: BTreeMap<String, FailureStreak>,
}

impl GroupBackoff {
    /// Create a tracker using the given policy.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            streaks: BTreeMap::new(),
        }
    }

    /// Record a provisioning failure for `group` observed at `now`.
    ///
    /// Failures reported while the group is already backing off belong to
    /// the round that started the backoff and do not extend it.
    ///
    /// Returns the instant before which the group should not be provisioned.
    pub fn record_failure(&mut self, group: &str, now: Instant) -> Instant {
        let streak = self
            .streaks
            .entry(group.to_string())
            .or_insert(FailureStreak {
                consecutive: 0,
                retry_at: now,
            });

        if streak.consecutive > 0 && now < streak.retry_at {
            return streak.retry_at;
        }

        let delay = self.policy.delay(streak.consecutive);
        streak.consecutive = streak.consecutive.saturating_add(1);
        streak.retry_at = now + delay;
        streak.retry_at
    }

    /// Clear the failure streak for `group`.
    pub fn record_success(&mut self, group: &str) {
        self.streaks.remove(group);
    }

    /// Consecutive provisioning failures recorded for `group`.
    pub fn consecutive_failures(&self, group: &str) -> u32 {
        self.streaks.get(group).map_or(0, |s| s.consecutive)
    }

    /// If `group` is still backing off at `now`, the instant it becomes ready.
    pub fn blocked_until(&self, group: &str, now: Instant) -> Option<Instant> {
        self.streaks
            .get(group)
            .map(|s| s.retry_at)
            .filter(|retry_at| *retry_at > now)
    }

    /// Earliest future instant at which some blocked group becomes ready.
    pub fn next_ready_at(&self, now: Instant) -> Option<Instant> {
        self.streaks
            .values()
            .map(|s| s.retry_at)
            .filter(|retry_at| *retry_at > now)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(base_ms: u64, max_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_deficit() {
        assert_eq!(deficit(3, 0), 3);
        assert_eq!(deficit(3, 2), 1);
        assert_eq!(deficit(3, 3), 0);
        assert_eq!(deficit(3, 5), 0);
    }

    #[test]
    fn test_observation_over_target() {
        let obs = GroupObservation {
            desired: 1,
            live: 2,
        };
        assert!(obs.is_over_target());
        assert_eq!(obs.deficit(), 0);
    }

    #[test]
    fn test_backoff_doubles_until_max() {
        let policy = no_jitter(100, 1_000);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_disabled_backoff_is_zero() {
        let policy = BackoffPolicy::disabled();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(10), Duration::ZERO);
    }

    #[test]
    fn test_group_backoff_blocks_then_releases() {
        let mut backoff = GroupBackoff::new(no_jitter(100, 1_000));
        let now = Instant::now();

        let retry_at = backoff.record_failure("build", now);
        assert_eq!(retry_at, now + Duration::from_millis(100));
        assert_eq!(backoff.blocked_until("build", now), Some(retry_at));
        assert_eq!(backoff.blocked_until("build", retry_at), None);
        assert_eq!(backoff.blocked_until("deploy", now), None);

        let retry_at = backoff.record_failure("build", retry_at);
        assert_eq!(retry_at, now + Duration::from_millis(300));
        assert_eq!(backoff.consecutive_failures("build"), 2);
    }

    #[test]
    fn test_failures_within_one_round_count_once() {
        let mut backoff = GroupBackoff::new(no_jitter(100, 10_000));
        let now = Instant::now();

        let first = backoff.record_failure("build", now);
        for i in 1..8 {
            let later = now + Duration::from_millis(i);
            assert_eq!(backoff.record_failure("build", later), first);
        }

        assert_eq!(first, now + Duration::from_millis(100));
        assert_eq!(backoff.consecutive_failures("build"), 1);

        // The next round, after the backoff expired, doubles.
        let second = backoff.record_failure("build", first);
        assert_eq!(second, first + Duration::from_millis(200));
        assert_eq!(backoff.consecutive_failures("build"), 2);
    }

    #[test]
    fn test_group_backoff_success_clears_streak() {
        let mut backoff = GroupBackoff::new(no_jitter(100, 1_000));
        let now = Instant::now();

        backoff.record_failure("build", now);
        backoff.record_success("build");

        assert_eq!(backoff.consecutive_failures("build"), 0);
        assert_eq!(backoff.blocked_until("build", now), None);
        assert_eq!(backoff.next_ready_at(now), None);
    }

    #[test]
    fn test_next_ready_at_picks_earliest() {
        let mut backoff = GroupBackoff::new(no_jitter(100, 10_000));
        let now = Instant::now();

        let a_ready = backoff.record_failure("a", now);
        backoff.record_failure("a", a_ready);
        let b_ready = backoff.record_failure("b", now);

        assert_eq!(backoff.next_ready_at(now), Some(b_ready));
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_max(
            base_ms in 0u64..10_000,
            max_ms in 0u64..100_000,
            jitter in 0.0f64..1.0,
            attempt in 0u32..64,
        ) {
            let policy = BackoffPolicy {
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms),
                jitter,
            };
            prop_assert!(policy.delay(attempt) <= Duration::from_millis(max_ms));
        }

        #[test]
        fn prop_deficit_plus_live_covers_desired(desired in 0u32..1_000, live in 0usize..2_000) {
            let d = deficit(desired, live);
            prop_assert!(d + live >= desired as usize);
            prop_assert!(d <= desired as usize);
        }
    }
}
