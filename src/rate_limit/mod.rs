//! Adaptive token-bucket rate limiter.
//!
//! One limiter is shared by all workers of a crawl. Each outbound request
//! consumes one token via [`AdaptiveRateLimiter::acquire`]; tokens refill
//! continuously at a rate that itself adapts to upstream feedback. Backs
//! off on 403/429/503, gradually recovers after a streak of successes.
//!
//! Refill is computed lazily from the clock inside `acquire`, so there is
//! no background timer task. Feedback calls are plain short critical
//! sections and never suspend; the only suspension point is the sleep
//! inside `acquire`. A caller cancelled while waiting leaves the token
//! count untouched.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Statuses that indicate the upstream is pushing back on request volume.
fn is_backoff_status(status: u16) -> bool {
    matches!(status, 403 | 429 | 503)
}

/// Tuning knobs for the limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Starting refill rate, tokens (requests) per second.
    pub initial_rps: f64,
    /// Floor the rate never drops below.
    pub min_rps: f64,
    /// Ceiling the rate never recovers above.
    pub max_rps: f64,
    /// Multiplier applied on a backoff status.
    pub backoff_factor: f64,
    /// Multiplier applied after a full success streak.
    pub recovery_factor: f64,
    /// Consecutive successes required before one recovery step.
    pub success_streak_threshold: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            initial_rps: 2.0,
            min_rps: 0.5,
            max_rps: 10.0,
            backoff_factor: 0.8,
            recovery_factor: 1.05,
            success_streak_threshold: 100,
        }
    }
}

/// Point-in-time counters, for status output and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    pub success_count: u64,
    pub error_count: u64,
    /// Number of backoff steps taken (rate reductions).
    pub backoff_count: u64,
    pub current_rps: f64,
    pub success_streak: u64,
}

#[derive(Debug)]
struct BucketState {
    /// Current refill rate, tokens/sec. Also the bucket cap (one second
    /// of burst).
    rate: f64,
    tokens: f64,
    last_refill: Instant,
    success_streak: u64,
    success_count: u64,
    error_count: u64,
    backoff_count: u64,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.rate);
    }

    fn set_rate(&mut self, rate: f64) {
        self.rate = rate;
        if self.tokens > rate {
            self.tokens = rate;
        }
    }
}

/// Token bucket whose refill rate adapts to success/error feedback.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let state = BucketState {
            rate: config.initial_rps,
            tokens: config.initial_rps,
            last_refill: Instant::now(),
            success_streak: 0,
            success_count: 0,
            error_count: 0,
            backoff_count: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until one token is available and consume it.
    ///
    /// Cancellation-safe: the token is deducted only on the return path,
    /// so a caller dropped mid-wait changes nothing.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.lock();
                state.refill(Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / state.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a successful request; may step the rate back up.
    pub fn report_success(&self) {
        let mut state = self.lock();
        state.success_count += 1;
        state.success_streak += 1;

        if state.success_streak >= self.config.success_streak_threshold {
            let new_rate = (state.rate * self.config.recovery_factor).min(self.config.max_rps);
            if new_rate > state.rate {
                debug!(
                    "rate limiter recovering: {:.2} -> {:.2} rps",
                    state.rate, new_rate
                );
            }
            state.set_rate(new_rate);
            state.success_streak = 0;
        }
    }

    /// Record a failed request; backoff statuses shrink the rate.
    ///
    /// Pass status 0 for failures without an HTTP status (network errors,
    /// timeouts); those reset the streak but keep the rate.
    pub fn report_error(&self, status: u16) {
        let mut state = self.lock();
        state.error_count += 1;
        state.success_streak = 0;

        if is_backoff_status(status) {
            let new_rate = (state.rate * self.config.backoff_factor).max(self.config.min_rps);
            state.backoff_count += 1;
            warn!(
                "rate limited upstream (HTTP {}), backing off: {:.2} -> {:.2} rps",
                status, state.rate, new_rate
            );
            state.set_rate(new_rate);
        }
    }

    /// Current refill rate in tokens/sec.
    pub fn current_rps(&self) -> f64 {
        self.lock().rate
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = self.lock();
        RateLimiterStats {
            success_count: state.success_count,
            error_count: state.error_count,
            backoff_count: state.backoff_count,
            current_rps: state.rate,
            success_streak: state.success_streak,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(initial: f64, min: f64, max: f64) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(RateLimiterConfig {
            initial_rps: initial,
            min_rps: min,
            max_rps: max,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn full_bucket_acquires_without_waiting() {
        let l = limiter(5.0, 1.0, 10.0);
        let before = Instant::now();
        for _ in 0..5 {
            l.acquire().await;
        }
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_one_refill_interval() {
        let l = limiter(4.0, 1.0, 10.0);
        for _ in 0..4 {
            l.acquire().await;
        }
        let before = Instant::now();
        l.acquire().await;
        let waited = Instant::now() - before;
        // One token at 4 rps is 250 ms.
        assert!(waited >= Duration::from_millis(200), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(300), "waited {:?}", waited);
    }

    #[test]
    fn backoff_halves_rate_with_factor_half() {
        let l = AdaptiveRateLimiter::new(RateLimiterConfig {
            initial_rps: 100.0,
            min_rps: 10.0,
            max_rps: 200.0,
            backoff_factor: 0.5,
            ..Default::default()
        });
        l.report_error(503);
        assert_eq!(l.current_rps(), 50.0);
    }

    #[test]
    fn repeated_backoff_clamps_at_min_rps() {
        let l = AdaptiveRateLimiter::new(RateLimiterConfig {
            initial_rps: 100.0,
            min_rps: 10.0,
            max_rps: 200.0,
            backoff_factor: 0.5,
            ..Default::default()
        });
        for _ in 0..4 {
            l.report_error(503);
        }
        assert_eq!(l.current_rps(), 10.0);
        assert_eq!(l.stats().error_count, 4);
        assert_eq!(l.stats().backoff_count, 4);
    }

    #[test]
    fn success_streak_steps_rate_up() {
        let l = AdaptiveRateLimiter::new(RateLimiterConfig {
            initial_rps: 2.0,
            min_rps: 1.0,
            max_rps: 16.0,
            recovery_factor: 2.0,
            success_streak_threshold: 5,
            ..Default::default()
        });
        for _ in 0..5 {
            l.report_success();
        }
        assert_eq!(l.current_rps(), 4.0);
        // Streak resets after the step.
        assert_eq!(l.stats().success_streak, 0);
    }

    #[test]
    fn recovery_clamps_at_max_rps() {
        let l = AdaptiveRateLimiter::new(RateLimiterConfig {
            initial_rps: 8.0,
            min_rps: 1.0,
            max_rps: 10.0,
            recovery_factor: 2.0,
            success_streak_threshold: 1,
            ..Default::default()
        });
        l.report_success();
        l.report_success();
        assert_eq!(l.current_rps(), 10.0);
    }

    #[test]
    fn non_backoff_errors_keep_rate_but_reset_streak() {
        let l = AdaptiveRateLimiter::new(RateLimiterConfig {
            initial_rps: 2.0,
            min_rps: 1.0,
            max_rps: 16.0,
            recovery_factor: 2.0,
            success_streak_threshold: 3,
            ..Default::default()
        });
        l.report_success();
        l.report_success();
        l.report_error(404);
        assert_eq!(l.current_rps(), 2.0);
        assert_eq!(l.stats().success_streak, 0);
        // The interrupted streak must start over.
        l.report_success();
        l.report_success();
        l.report_success();
        assert_eq!(l.current_rps(), 4.0);
    }

    #[test]
    fn network_error_status_zero_is_not_backoff() {
        let l = limiter(2.0, 0.5, 10.0);
        l.report_error(0);
        assert_eq!(l.current_rps(), 2.0);
        assert_eq!(l.stats().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_caps_stored_tokens() {
        let l = AdaptiveRateLimiter::new(RateLimiterConfig {
            initial_rps: 10.0,
            min_rps: 1.0,
            max_rps: 10.0,
            backoff_factor: 0.1,
            ..Default::default()
        });
        // Bucket starts full at 10 tokens; dropping the rate to 1 rps
        // must also drop the burst allowance.
        l.report_error(429);
        l.acquire().await;
        let before = Instant::now();
        l.acquire().await;
        assert!(Instant::now() - before >= Duration::from_millis(900));
    }
}
