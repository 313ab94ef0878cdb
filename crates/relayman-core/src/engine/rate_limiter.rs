//! Per connection-class send pacing
//!
//! Two independent escalation paths live here:
//! - local adaptive pacing driven by a sliding 60 second window of sends
//! - hard waits dictated by the transport's flood-wait signals
//!
//! A throttle signal resets the local backoff state instead of compounding with it.

use rand::Rng;
use relayman_types::{AuthMethod, RateLimitProfile};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);

/// Upper bound of any retry backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Upper bound in seconds of any configured delay or cooldown
pub const MAX_DELAY_SECS: f64 = 3600.0;

/// Share of `max_forwards_per_minute` above which pacing slows down
const SLOWDOWN_THRESHOLD: f64 = 0.8;
const SLOWDOWN_FACTOR: f64 = 1.5;
const JITTER_RATIO: f64 = 0.05;

/// Rate limiter shared by every task running on one connection class
#[derive(Clone)]
pub struct RateLimiter {
    auth_method: AuthMethod,
    profile: Arc<RateLimitProfile>,
    max_backoff: Duration,
    state: Arc<Mutex<RateLimiterState>>,
}

struct RateLimiterState {
    /// Send timestamps of the trailing window, oldest first
    window: VecDeque<Instant>,
    /// Transient pacing multiplier, inflated by failed sends
    backoff_multiplier: f64,
    /// Sends since the last batch cooldown
    batch_sends: u32,
    cooldown_pending: bool,
    /// Earliest instant the next caller may send. Each caller reserves its
    /// slot here, so concurrent tasks queue up instead of sending together.
    next_slot: Instant,
}

impl RateLimiterState {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.window.front() {
            if now.duration_since(oldest) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter {
    /// Create a limiter for one connection class
    pub fn new(auth_method: AuthMethod, profile: RateLimitProfile, max_backoff: Duration) -> Self {
        Self {
            auth_method,
            profile: Arc::new(profile),
            max_backoff: max_backoff.min(MAX_BACKOFF),
            state: Arc::new(Mutex::new(RateLimiterState {
                window: VecDeque::new(),
                backoff_multiplier: 1.0,
                batch_sends: 0,
                cooldown_pending: false,
                next_slot: Instant::now(),
            })),
        }
    }

    pub fn auth_method(&self) -> AuthMethod {
        self.auth_method
    }

    pub fn profile(&self) -> &RateLimitProfile {
        &self.profile
    }

    /// Suspend the caller until the next send is allowed, then record it.
    ///
    /// Must be called exactly once per attempted send, before the attempt.
    pub async fn wait_before_send(&self) {
        let send_at = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            state.prune(now);
            let cooldown = if state.cooldown_pending {
                state.cooldown_pending = false;
                seconds(self.profile.batch_cooldown)
            } else {
                Duration::ZERO
            };
            let delay = self.pacing_delay(state.window.len(), state.backoff_multiplier) + cooldown;
            let send_at = state.next_slot.max(now) + delay;
            state.next_slot = send_at;
            send_at
        };

        tokio::time::sleep_until(send_at).await;

        // Hard cap: the check and the record happen under one lock so the
        // window never holds more than `max_forwards_per_minute` sends.
        let max = self.profile.max_forwards_per_minute.max(1) as usize;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.prune(now);
                if state.window.len() < max {
                    state.window.push_back(now);
                    state.batch_sends += 1;
                    if self.profile.batch_size > 0 && state.batch_sends >= self.profile.batch_size {
                        state.batch_sends = 0;
                        state.cooldown_pending = true;
                    }
                    None
                } else {
                    state
                        .window
                        .front()
                        .map(|oldest| (*oldest + WINDOW).saturating_duration_since(now))
                }
            };

            match wait {
                None => return,
                Some(wait) => {
                    debug!(
                        "{} window full ({} sends/min), waiting {:?}",
                        self.auth_method, max, wait
                    );
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Honor a transport flood-wait of exactly `wait_seconds`
    pub async fn on_throttle_signal(&self, wait_seconds: u64) {
        warn!("Rate limited! Waiting {}s for {}", wait_seconds, self.auth_method);
        tokio::time::sleep(Duration::from_secs(wait_seconds)).await;
        self.state.lock().await.backoff_multiplier = 1.0;
    }

    /// Application-level retry delay for the given attempt number
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(&self.profile, attempt, self.max_backoff)
    }

    /// Slow steady-state pacing after a failed send
    pub async fn note_failure(&self) {
        let mut state = self.state.lock().await;
        let factor = self.profile.backoff_multiplier.max(1.0);
        state.backoff_multiplier = (state.backoff_multiplier * factor).min(8.0);
    }

    /// Return to normal pacing after a delivered send
    pub async fn note_success(&self) {
        self.state.lock().await.backoff_multiplier = 1.0;
    }

    pub async fn backoff_multiplier(&self) -> f64 {
        self.state.lock().await.backoff_multiplier
    }

    /// Sends recorded in the trailing 60 seconds
    pub async fn sends_in_window(&self) -> usize {
        let mut state = self.state.lock().await;
        state.prune(Instant::now());
        state.window.len()
    }

    fn pacing_delay(&self, recent_sends: usize, multiplier: f64) -> Duration {
        let profile = &*self.profile;
        let mut delay = profile.base_delay * multiplier;

        let max_per_min = profile.max_forwards_per_minute as f64;
        if recent_sends as f64 > max_per_min * SLOWDOWN_THRESHOLD {
            delay *= SLOWDOWN_FACTOR;
            warn!(
                "Rate limit approaching for {}: {}/{}",
                self.auth_method, recent_sends, profile.max_forwards_per_minute
            );
        }

        let spread = profile.base_delay.abs() * JITTER_RATIO;
        if spread > 0.0 && spread.is_finite() {
            delay += rand::thread_rng().gen_range(-spread..=spread);
        }

        seconds(delay.max(profile.min_delay).min(profile.max_delay))
    }
}

/// Convert configured seconds to a duration, clamped to `0..=MAX_DELAY_SECS`
fn seconds(value: f64) -> Duration {
    if value.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_DELAY_SECS)).unwrap_or(Duration::ZERO)
}

/// `min(base_delay * backoff_multiplier^attempt, cap)`, non-decreasing in `attempt`
pub fn backoff_delay(profile: &RateLimitProfile, attempt: u32, cap: Duration) -> Duration {
    let cap = cap.min(MAX_BACKOFF);
    let base = profile.base_delay.max(0.0);
    let multiplier = profile.backoff_multiplier.max(1.0);
    let secs = base * multiplier.powf(attempt as f64);
    if secs.is_finite() && secs < cap.as_secs_f64() {
        Duration::try_from_secs_f64(secs).unwrap_or(cap)
    } else {
        cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(base: f64, min: f64, max: f64, per_minute: u32) -> RateLimitProfile {
        RateLimitProfile {
            base_delay: base,
            min_delay: min,
            max_delay: max,
            batch_size: 0,
            batch_cooldown: 0.0,
            max_forwards_per_minute: per_minute,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_uses_base_delay_with_jitter() {
        let limiter = RateLimiter::new(
            AuthMethod::UserAccount,
            profile(1.0, 0.5, 3.0, 40),
            Duration::from_secs(300),
        );

        let start = Instant::now();
        limiter.wait_before_send().await;
        let elapsed = start.elapsed().as_secs_f64();
        assert!((0.95..=1.05).contains(&elapsed), "elapsed {elapsed}");
        assert_eq!(limiter.sends_in_window().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_slows_down_near_limit() {
        let limiter = RateLimiter::new(
            AuthMethod::UserAccount,
            profile(1.0, 0.5, 3.0, 40),
            Duration::from_secs(300),
        );
        {
            let mut state = limiter.state.lock().await;
            for _ in 0..33 {
                state.window.push_back(Instant::now());
            }
        }

        let start = Instant::now();
        limiter.wait_before_send().await;
        let elapsed = start.elapsed().as_secs_f64();
        assert!((1.45..=1.55).contains(&elapsed), "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_clamped_to_max() {
        let limiter = RateLimiter::new(
            AuthMethod::BotAccount,
            profile(5.0, 0.1, 1.0, 80),
            Duration::from_secs(300),
        );

        let start = Instant::now();
        limiter.wait_before_send().await;
        assert!(start.elapsed() <= Duration::from_millis(1001));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_exceeds_max_per_minute() {
        let limiter = RateLimiter::new(
            AuthMethod::BotAccount,
            profile(0.1, 0.1, 0.1, 10),
            Duration::from_secs(300),
        );

        let mut sent = Vec::new();
        for _ in 0..25 {
            limiter.wait_before_send().await;
            sent.push(Instant::now());
        }

        for (i, at) in sent.iter().enumerate() {
            let in_window = sent[..=i]
                .iter()
                .filter(|t| at.duration_since(**t) < WINDOW)
                .count();
            assert!(in_window <= 10, "{in_window} sends in window ending at #{i}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_cooldown_after_batch_size_sends() {
        let mut p = profile(0.1, 0.1, 0.1, 1000);
        p.batch_size = 3;
        p.batch_cooldown = 10.0;
        let limiter = RateLimiter::new(AuthMethod::BotAccount, p, Duration::from_secs(300));

        for _ in 0..3 {
            limiter.wait_before_send().await;
        }
        let start = Instant::now();
        limiter.wait_before_send().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_signal_waits_and_resets_backoff() {
        let limiter = RateLimiter::new(
            AuthMethod::UserAccount,
            profile(1.0, 0.5, 3.0, 40),
            Duration::from_secs(300),
        );
        limiter.note_failure().await;
        limiter.note_failure().await;
        assert_eq!(limiter.backoff_multiplier().await, 4.0);

        let start = Instant::now();
        limiter.on_throttle_signal(17).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(17) && elapsed < Duration::from_millis(17_010));
        assert_eq!(limiter.backoff_multiplier().await, 1.0);
    }

    #[test]
    fn test_backoff_non_decreasing_and_capped() {
        let cap = Duration::from_secs(300);
        for base in [0.0, 0.1, 0.3, 1.0, 7.5, 120.0] {
            for multiplier in [0.5, 1.0, 1.5, 2.0, 3.0, 10.0] {
                let mut p = profile(base, 0.0, 10.0, 40);
                p.backoff_multiplier = multiplier;
                let mut previous = Duration::ZERO;
                for attempt in 0..200 {
                    let delay = backoff_delay(&p, attempt, cap);
                    assert!(delay >= previous, "base {base} mult {multiplier} attempt {attempt}");
                    assert!(delay <= cap);
                    previous = delay;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_spaced_apart() {
        let limiter = RateLimiter::new(
            AuthMethod::UserAccount,
            profile(1.0, 1.0, 1.0, 1000),
            Duration::from_secs(300),
        );

        let start = Instant::now();
        let (a, b, c) = tokio::join!(
            async {
                limiter.wait_before_send().await;
                start.elapsed()
            },
            async {
                limiter.wait_before_send().await;
                start.elapsed()
            },
            async {
                limiter.wait_before_send().await;
                start.elapsed()
            }
        );

        let mut sent = [a, b, c];
        sent.sort();
        assert_eq!(sent[0], Duration::from_secs(1));
        assert_eq!(sent[1], Duration::from_secs(2));
        assert_eq!(sent[2], Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_profile_values_do_not_panic() {
        let mut p = profile(1e300, 0.0, f64::INFINITY, 1000);
        p.batch_size = 1;
        p.batch_cooldown = 1e300;
        let limiter = RateLimiter::new(AuthMethod::BotAccount, p, Duration::from_secs(u64::MAX));

        let start = Instant::now();
        limiter.wait_before_send().await;
        assert_eq!(start.elapsed(), Duration::from_secs_f64(MAX_DELAY_SECS));
        assert_eq!(limiter.backoff_delay(50), MAX_BACKOFF);
    }

    #[test]
    fn test_backoff_values() {
        let p = profile(1.0, 0.5, 3.0, 40);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(&p, 0, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(&p, 3, cap), Duration::from_secs(8));
        assert_eq!(backoff_delay(&p, 9, cap), cap);
        assert_eq!(backoff_delay(&p, 20, Duration::from_secs(3600)), MAX_BACKOFF);
    }
}
