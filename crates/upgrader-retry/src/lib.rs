//! Reconnection backoff policy for the upgrader agent.
//!
//! The agent's transport never gives up on the control plane: after a
//! disconnect it re-dials on an exponential schedule with additive jitter,
//! and once the attempt counter reaches its cap the schedule keeps firing
//! at the capped delay forever.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use upgrader_retry::{ReconnectPolicy, ReconnectSchedule};
//!
//! let policy = ReconnectPolicy {
//!     base_delay: Duration::from_secs(1),
//!     max_delay: Duration::from_secs(60),
//!     max_attempts: 5,
//!     jitter: Duration::from_secs(1),
//! };
//!
//! let mut schedule = ReconnectSchedule::new(policy);
//! let first = schedule.next_delay();
//! assert!(first >= Duration::from_secs(1) && first <= Duration::from_secs(2));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration for the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay for the first retry; doubles on each subsequent attempt.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Hard ceiling applied after jitter.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Attempt counter cap. Once reached, the exponent stops growing but
    /// retries continue indefinitely at the capped delay.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound of the uniform random delay added on top of the
    /// exponential term.
    #[serde(default = "default_jitter")]
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    10
}

fn default_jitter() -> Duration {
    Duration::from_secs(1)
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

/// Calculate the delay for a given attempt number (0-indexed):
/// `min(base * 2^min(attempt, max_attempts) + U(0, jitter), max)`.
pub fn delay_for_attempt(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let exp = attempt.min(policy.max_attempts).min(24);
    let exponential = policy
        .base_delay
        .saturating_mul(2_u32.saturating_pow(exp))
        .min(policy.max_delay);
    exponential
        .saturating_add(random_jitter(policy.jitter))
        .min(policy.max_delay)
}

/// Advance the attempt counter, clamping at `max_attempts` so the schedule
/// continues at the cap indefinitely.
pub fn next_attempt(policy: &ReconnectPolicy, attempt: u32) -> u32 {
    attempt.saturating_add(1).min(policy.max_attempts)
}

fn random_jitter(bound: Duration) -> Duration {
    use rand::Rng;

    if bound.is_zero() {
        return Duration::ZERO;
    }
    let mut rng = rand::rng();
    let millis = rng.random_range(0..=bound.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Stateful wrapper used by the transport driver: hand out the delay for the
/// current attempt, advance the counter, and reset on a successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ReconnectSchedule {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// The delay to sleep before the next connection attempt. Advances the
    /// attempt counter as a side effect.
    pub fn next_delay(&mut self) -> Duration {
        let delay = delay_for_attempt(&self.policy, self.attempt);
        self.attempt = next_attempt(&self.policy, self.attempt);
        delay
    }

    /// Current attempt counter (number of consecutive failures observed).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = no_jitter_policy();
        assert_eq!(delay_for_attempt(&policy, 0), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(&policy, 1), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&policy, 2), Duration::from_secs(4));
        assert_eq!(delay_for_attempt(&policy, 4), Duration::from_secs(16));
    }

    #[test]
    fn exponent_stops_growing_at_the_attempt_cap() {
        let policy = no_jitter_policy();
        assert_eq!(delay_for_attempt(&policy, 5), Duration::from_secs(32));
        assert_eq!(delay_for_attempt(&policy, 6), Duration::from_secs(32));
        assert_eq!(delay_for_attempt(&policy, 100), Duration::from_secs(32));
    }

    #[test]
    fn delay_never_exceeds_max() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            jitter: Duration::from_secs(1),
        };
        for attempt in 0..32 {
            assert!(delay_for_attempt(&policy, attempt) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn jitter_is_additive_and_bounded() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: Duration::from_secs(1),
        };
        for _ in 0..100 {
            let delay = delay_for_attempt(&policy, 3);
            assert!(delay >= Duration::from_secs(8));
            assert!(delay <= Duration::from_secs(9));
        }
    }

    #[test]
    fn attempt_counter_clamps_at_max() {
        let policy = no_jitter_policy();
        let mut attempt = 0;
        for _ in 0..20 {
            attempt = next_attempt(&policy, attempt);
        }
        assert_eq!(attempt, 5);
    }

    #[test]
    fn schedule_resets_on_success() {
        let mut schedule = ReconnectSchedule::new(no_jitter_policy());
        assert_eq!(schedule.next_delay(), Duration::from_secs(1));
        assert_eq!(schedule.next_delay(), Duration::from_secs(2));
        assert_eq!(schedule.attempt(), 2);

        schedule.reset();
        assert_eq!(schedule.attempt(), 0);
        assert_eq!(schedule.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn capped_schedule_matches_published_bounds() {
        // base 1s, max 60s, jitter 1s, max_attempts 5: after five failures
        // every subsequent delay stays within [32, 60] seconds.
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: Duration::from_secs(1),
        };
        let mut schedule = ReconnectSchedule::new(policy);
        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(schedule.next_delay());
        }
        for (i, delay) in delays.iter().enumerate().take(5) {
            let floor = Duration::from_secs(1 << i);
            let ceiling = floor + Duration::from_secs(1);
            assert!(*delay >= floor && *delay <= ceiling, "attempt {i}: {delay:?}");
        }
        for delay in &delays[5..] {
            assert!(*delay >= Duration::from_secs(32));
            assert!(*delay <= Duration::from_secs(60));
        }
    }

    #[test]
    fn policy_deserializes_human_durations() {
        let json = r#"{"base_delay": "2s", "max_delay": "1m", "max_attempts": 7, "jitter": "500ms"}"#;
        let policy: ReconnectPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.jitter, Duration::from_millis(500));
    }
}
