//! Sliding-window admission control for the governed CRM API.
//!
//! Pure bookkeeping: every method takes the current instant explicitly so the
//! owner (the operation queue consumer) decides when time advances.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);
const WAIT_MARGIN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Admitted calls per trailing second. Kept below the documented remote limit.
    pub budget_per_second: usize,
    pub throttle_base: Duration,
    pub throttle_ceiling: Duration,
    pub block_base: Duration,
    pub block_ceiling: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            budget_per_second: 6,
            throttle_base: Duration::from_secs(5),
            throttle_ceiling: Duration::from_secs(60),
            block_base: Duration::from_secs(30),
            block_ceiling: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub budget_per_second: usize,
    pub calls_in_window: usize,
    pub cooldown_remaining_ms: u64,
    pub consecutive_throttles: u32,
    pub consecutive_blocks: u32,
}

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    policy: RateLimitPolicy,
    recent_calls: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    consecutive_throttles: u32,
    consecutive_blocks: u32,
}

impl SlidingWindowLimiter {
    pub fn new(mut policy: RateLimitPolicy) -> Self {
        policy.budget_per_second = policy.budget_per_second.max(1);
        Self {
            recent_calls: VecDeque::with_capacity(policy.budget_per_second),
            policy,
            cooldown_until: None,
            consecutive_throttles: 0,
            consecutive_blocks: 0,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.recent_calls.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                self.recent_calls.pop_front();
            } else {
                break;
            }
        }
        if let Some(until) = self.cooldown_until {
            if now >= until {
                self.cooldown_until = None;
            }
        }
    }

    pub fn can_proceed(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.cooldown_until.is_none() && self.recent_calls.len() < self.policy.budget_per_second
    }

    /// Must follow a successful `can_proceed` before the call is issued.
    pub fn record_call(&mut self, now: Instant) {
        self.prune(now);
        self.recent_calls.push_back(now);
    }

    /// How long to sleep before `can_proceed` is worth asking again.
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if let Some(until) = self.cooldown_until {
            return until.saturating_duration_since(now);
        }
        if self.recent_calls.len() < self.policy.budget_per_second {
            return Duration::ZERO;
        }
        match self.recent_calls.front() {
            Some(oldest) => (*oldest + WINDOW).saturating_duration_since(now) + WAIT_MARGIN,
            None => Duration::ZERO,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_throttles = 0;
        self.consecutive_blocks = 0;
    }

    /// Returns the cooldown that was applied.
    pub fn record_throttled(&mut self, now: Instant) -> Duration {
        self.consecutive_throttles = self.consecutive_throttles.saturating_add(1);
        let cooldown = escalate(
            self.policy.throttle_base,
            self.consecutive_throttles,
            self.policy.throttle_ceiling,
        );
        self.cooldown_until = Some(now + cooldown);
        cooldown
    }

    /// Returns the cooldown that was applied.
    pub fn record_blocked(&mut self, now: Instant) -> Duration {
        self.consecutive_blocks = self.consecutive_blocks.saturating_add(1);
        let cooldown = escalate(
            self.policy.block_base,
            self.consecutive_blocks,
            self.policy.block_ceiling,
        );
        self.cooldown_until = Some(now + cooldown);
        cooldown
    }

    pub fn consecutive_throttles(&self) -> u32 {
        self.consecutive_throttles
    }

    pub fn consecutive_blocks(&self) -> u32 {
        self.consecutive_blocks
    }

    pub fn snapshot(&mut self, now: Instant) -> RateLimiterSnapshot {
        self.prune(now);
        let cooldown_remaining = self
            .cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        RateLimiterSnapshot {
            budget_per_second: self.policy.budget_per_second,
            calls_in_window: self.recent_calls.len(),
            cooldown_remaining_ms: cooldown_remaining.as_millis() as u64,
            consecutive_throttles: self.consecutive_throttles,
            consecutive_blocks: self.consecutive_blocks,
        }
    }
}

fn escalate(base: Duration, count: u32, ceiling: Duration) -> Duration {
    base.saturating_mul(count).min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(budget: usize) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(RateLimitPolicy {
            budget_per_second: budget,
            ..RateLimitPolicy::default()
        })
    }

    #[test]
    fn call_beyond_budget_waits_for_oldest_slot() {
        let mut limiter = limiter(3);
        let start = Instant::now();
        for i in 0..3 {
            let at = start + Duration::from_millis(i * 100);
            assert!(limiter.can_proceed(at));
            limiter.record_call(at);
        }

        let fourth = start + Duration::from_millis(300);
        assert!(!limiter.can_proceed(fourth));
        assert_eq!(
            limiter.wait_time(fourth),
            Duration::from_millis(700) + WAIT_MARGIN
        );

        let after_window = start + Duration::from_millis(1000);
        assert!(limiter.can_proceed(after_window));
        limiter.record_call(after_window);
        assert_eq!(limiter.snapshot(after_window).calls_in_window, 3);
    }

    #[test]
    fn block_holds_cooldown_and_success_resets_counter() {
        let mut limiter = limiter(6);
        let start = Instant::now();

        let cooldown = limiter.record_blocked(start);
        assert_eq!(cooldown, Duration::from_secs(30));
        assert_eq!(limiter.consecutive_blocks(), 1);
        assert!(!limiter.can_proceed(start + Duration::from_secs(29)));
        assert_eq!(
            limiter.wait_time(start + Duration::from_secs(20)),
            Duration::from_secs(10)
        );
        assert!(limiter.can_proceed(start + Duration::from_secs(30)));

        limiter.record_success();
        assert_eq!(limiter.consecutive_blocks(), 0);
    }

    #[test]
    fn throttle_and_block_escalate_independently_up_to_ceiling() {
        let mut limiter = limiter(6);
        let now = Instant::now();

        assert_eq!(limiter.record_throttled(now), Duration::from_secs(5));
        assert_eq!(limiter.record_throttled(now), Duration::from_secs(10));
        assert_eq!(limiter.consecutive_blocks(), 0);
        for _ in 0..20 {
            limiter.record_throttled(now);
        }
        assert_eq!(limiter.record_throttled(now), Duration::from_secs(60));

        for _ in 0..20 {
            limiter.record_blocked(now);
        }
        assert_eq!(limiter.record_blocked(now), Duration::from_secs(300));
        assert_eq!(limiter.consecutive_throttles(), 23);
    }
}
