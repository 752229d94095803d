//! Deterministic exponential backoff with jitter and cap (spec §4.3), plus
//! `Retry-After` parsing so a server hint can override the computed delay.

use chrono::{DateTime, Utc};
use rand::RngCore;
use std::time::Duration;

/// `delayFor(attempts) = min(cap, base * 2^(attempts-1)) + uniform(0, jitter)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(5 * 60),
            jitter: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    /// `attempts` is 1-based (the attempt number that just failed). `rng`
    /// is injected per spec §9 so tests can drive jitter deterministically.
    pub fn delay_for(&self, attempts: u32, rng: &mut dyn RngCore) -> Duration {
        let exp = attempts.saturating_sub(1).min(62);
        let scaled = self.base.checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        let exponential = match scaled {
            Some(d) => d.min(self.cap),
            None => self.cap,
        };

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.next_u64() % (jitter_ms + 1))
        };

        exponential + jitter
    }

    /// Combine the computed delay with a server `Retry-After` hint: the
    /// engine always honors the larger of the two (spec §4.3), to avoid a
    /// thundering herd when the server asks for less than our own backoff
    /// would already wait.
    pub fn effective_delay(computed: Duration, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }
}

/// Parse a `Retry-After` header value (seconds, or an HTTP-date per RFC 7231)
/// into a `Duration` relative to `now`. Unparseable values return `None`
/// rather than erroring — a malformed hint should not block retry scheduling.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let trimmed = value.trim();

    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    if let Ok(when) = DateTime::parse_from_rfc2822(trimmed) {
        let when_utc = when.with_timezone(&Utc);
        let delta = when_utc.signed_duration_since(now);
        return delta.to_std().ok();
    }

    None
}
