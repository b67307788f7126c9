//! Restart backoff with jitter and an attempt budget

use rand::Rng;
use std::time::Duration;
use tracing::debug;

use crate::config::KnxdConfig;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Restarts allowed before giving up (0 means unlimited)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// ±25% randomisation so restarts of several bridges don't line up
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &KnxdConfig) -> Self {
        Self {
            max_attempts: config.max_restart_attempts,
            initial_delay: config.restart_delay(),
            max_delay: config.max_restart_delay(),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Tracks consecutive restart attempts
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Attempts consumed since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.policy.max_attempts > 0 && self.attempt >= self.policy.max_attempts
    }

    /// Consume one attempt and return its delay, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        let delay = self.delay_for(self.attempt);
        debug!("Restart attempt {} scheduled in {:?}", self.attempt, delay);
        Some(delay)
    }

    /// Delay for the n-th attempt (1-based): initial * multiplier^(n-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let mut delay = self
            .policy
            .initial_delay
            .mul_f64(self.policy.multiplier.powi(exp));
        if delay > self.policy.max_delay {
            delay = self.policy.max_delay;
        }

        let jitter_range = delay.as_secs_f64() * 0.25;
        if self.policy.jitter && jitter_range > 0.0 {
            let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            delay = Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0));
        }
        delay
    }

    /// Called once the daemon is healthy again
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn policy(max_attempts: u32, jitter: bool) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_and_capped() {
        let mut backoff = Backoff::new(policy(0, false));
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().unwrap()).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert_eq!(delays[4], Duration::from_secs(1));
        assert_eq!(delays[5], Duration::from_secs(1));
    }

    #[test]
    fn test_budget_exhaustion_and_reset() {
        let mut backoff = Backoff::new(policy(2, false));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.is_exhausted());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert!(!backoff.is_exhausted());
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let backoff = Backoff::new(policy(0, true));
        for _ in 0..50 {
            let delay = backoff.delay_for(3);
            assert!(delay >= Duration::from_micros(299_999));
            assert!(delay <= Duration::from_micros(500_001));
        }
    }

    #[test]
    fn test_jitter_on_sub_millisecond_delay() {
        let backoff = Backoff::new(BackoffPolicy {
            initial_delay: Duration::from_micros(400),
            ..policy(0, true)
        });
        for _ in 0..50 {
            let delay = backoff.delay_for(1);
            assert!(delay >= Duration::from_micros(299));
            assert!(delay <= Duration::from_micros(501));
        }
        let zero = Backoff::new(BackoffPolicy {
            initial_delay: Duration::ZERO,
            ..policy(0, true)
        });
        assert_eq!(zero.delay_for(4), Duration::ZERO);
    }

    #[test]
    fn test_from_config() {
        let policy = BackoffPolicy::from_config(&KnxdConfig::default());
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.initial_delay, Duration::from_secs(5));
    }
}
