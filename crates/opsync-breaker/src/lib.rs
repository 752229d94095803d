//! Rolling-window circuit breaker (spec §3.5, §4.4). In-memory only — not
//! persisted across process restarts, unlike the queue or the processing
//! lock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitMode {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub window: ChronoDuration,
    pub threshold: u32,
    pub cooldown: ChronoDuration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: ChronoDuration::seconds(60),
            threshold: 10,
            cooldown: ChronoDuration::seconds(60),
        }
    }
}

/// Three-state controller that short-circuits outbound calls after a burst
/// of failures (spec §4.4). Only network errors, 5xx, and timeouts should be
/// reported via `record_failure` — the caller (the `Engine`) is responsible
/// for filtering via `ErrorKind::counts_toward_breaker`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    mode: CircuitMode,
    failure_timestamps: Vec<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    /// Set while a single half-open probe is outstanding, so a second
    /// concurrent `allow_attempt` call during `HalfOpen` is refused.
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            mode: CircuitMode::Closed,
            failure_timestamps: Vec::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn mode(&self) -> CircuitMode {
        self.mode
    }

    /// When `Open`, the time at which the breaker becomes eligible to
    /// transition to `HalfOpen`. `None` outside the `Open` state.
    pub fn half_open_ready_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at.map(|t| t + self.config.cooldown)
    }

    /// When the breaker last tripped to `Open`. `None` if it has never
    /// tripped, or has since closed again.
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    /// Must be called before every API attempt. Returns `true` if the
    /// attempt may proceed.
    pub fn allow_attempt(&mut self, now: DateTime<Utc>) -> bool {
        match self.mode {
            CircuitMode::Closed => true,
            CircuitMode::Open => {
                let ready_at = self.half_open_ready_at().expect("opened_at set while Open");
                if now >= ready_at {
                    self.mode = CircuitMode::HalfOpen;
                    self.probe_in_flight = true;
                    tracing::info!("circuit breaker: open -> half_open, permitting probe");
                    true
                } else {
                    false
                }
            }
            CircuitMode::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self, _now: DateTime<Utc>) {
        match self.mode {
            CircuitMode::Closed => {
                self.failure_timestamps.clear();
            }
            CircuitMode::HalfOpen => {
                tracing::info!("circuit breaker: half_open -> closed, probe succeeded");
                self.mode = CircuitMode::Closed;
                self.failure_timestamps.clear();
                self.opened_at = None;
                self.probe_in_flight = false;
            }
            CircuitMode::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.prune(now);
        match self.mode {
            CircuitMode::Closed => {
                self.failure_timestamps.push(now);
                if self.failure_timestamps.len() as u32 >= self.config.threshold {
                    tracing::warn!(
                        threshold = self.config.threshold,
                        "circuit breaker: closed -> open"
                    );
                    self.mode = CircuitMode::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitMode::HalfOpen => {
                tracing::warn!("circuit breaker: half_open -> open, probe failed");
                self.mode = CircuitMode::Open;
                self.opened_at = Some(now);
                self.probe_in_flight = false;
            }
            CircuitMode::Open => {}
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.config.window;
        self.failure_timestamps.retain(|t| now - *t <= window);
    }
}
