//! Multi-window admission control with adaptive throttling.
//!
//! Three sliding windows (hourly, minute, burst) gate every request, with
//! per-endpoint windows created lazily. An externally reported upstream
//! quota and a multiplicative throttle factor tighten admission when the
//! downstream system pushes back. Admission is an outcome, never an error:
//! `admit` does not block and `record` does not fail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

/// Admission outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request fits in every applicable window.
    Admitted,
    /// Denied; retry after roughly this long.
    RetryAfter(Duration),
}

impl Admission {
    /// Whether this outcome admits the request.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// How a recorded request ended, for adaptive throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Completed normally.
    Success,
    /// The downstream signalled rate limiting.
    RateLimited,
    /// Failed for any other reason.
    Failed,
}

/// A sliding window over request timestamps.
///
/// At any observation the queue holds exactly the timestamps within the last
/// `size`, pruned before every count.
#[derive(Debug)]
pub struct RateLimitWindow {
    size: Duration,
    capacity: usize,
    requests: VecDeque<Instant>,
}

impl RateLimitWindow {
    /// Create an empty window.
    pub fn new(size: Duration, capacity: usize) -> Self {
        Self {
            size,
            capacity,
            requests: VecDeque::new(),
        }
    }

    /// Configured capacity before throttling.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.requests.front() {
            if now.duration_since(oldest) >= self.size {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current in-window request count.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.requests.len()
    }

    fn has_slot(&mut self, now: Instant, effective_capacity: usize) -> bool {
        self.count(now) < effective_capacity
    }

    fn push(&mut self, now: Instant) {
        self.requests.push_back(now);
        self.prune(now);
    }

    /// Time until the oldest in-window timestamp expires; zero when a slot
    /// is already free.
    pub fn time_until_slot(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.requests.len() < self.capacity {
            return Duration::ZERO;
        }
        match self.requests.front() {
            Some(&oldest) => (oldest + self.size).saturating_duration_since(now),
            // Zero-capacity windows never free a slot; hint one full window.
            None => self.size,
        }
    }
}

/// Externally reported quota of the downstream system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamQuota {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub used: u64,
    pub updated_at: DateTime<Utc>,
}

/// Remaining-slot floor below which the upstream quota denies admission.
const QUOTA_FLOOR: u64 = 10;

/// Cap on any single sleep inside `wait_until_admitted`, so the caller
/// re-evaluates at least once a minute.
const MAX_SINGLE_WAIT: Duration = Duration::from_secs(60);

/// Bounds on the adaptive throttle factor.
const THROTTLE_MIN: f64 = 1.0;
const THROTTLE_MAX: f64 = 10.0;

/// Quiet period after a rate-limit failure before the factor decays.
const THROTTLE_DECAY_AFTER: Duration = Duration::from_secs(300);

/// Rate limiter statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub denied_admissions: u64,
    pub rate_limited_failures: u64,
    pub total_wait_ms: u64,
}

/// Point-in-time usage of one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowUsage {
    pub current: usize,
    pub capacity: usize,
}

/// Point-in-time limiter status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStatus {
    pub hourly: WindowUsage,
    pub minute: WindowUsage,
    pub burst: WindowUsage,
    pub endpoints: HashMap<String, WindowUsage>,
    pub throttle_factor: f64,
    pub consecutive_rate_limits: u32,
    pub quota: Option<UpstreamQuota>,
    pub stats: RateLimiterStats,
}

struct LimiterState {
    hourly: RateLimitWindow,
    minute: RateLimitWindow,
    burst: RateLimitWindow,
    endpoints: HashMap<String, RateLimitWindow>,
    quota: Option<UpstreamQuota>,
    throttle_factor: f64,
    consecutive_rate_limits: u32,
    last_rate_limit: Option<Instant>,
    stats: RateLimiterStats,
}

impl LimiterState {
    fn effective_capacity(&self, capacity: usize) -> usize {
        if self.throttle_factor > THROTTLE_MIN {
            (capacity as f64 / self.throttle_factor).floor() as usize
        } else {
            capacity
        }
    }
}

/// Multi-window rate limiter with adaptive throttling.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a limiter from configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let state = LimiterState {
            hourly: RateLimitWindow::new(Duration::from_secs(3600), config.hourly_capacity),
            minute: RateLimitWindow::new(Duration::from_secs(60), config.minute_capacity),
            burst: RateLimitWindow::new(Duration::from_secs(10), config.burst_capacity),
            endpoints: HashMap::new(),
            quota: None,
            throttle_factor: THROTTLE_MIN,
            consecutive_rate_limits: 0,
            last_rate_limit: None,
            stats: RateLimiterStats::default(),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Non-blocking admission check across all applicable windows.
    pub fn admit(&self, endpoint: Option<&str>) -> Admission {
        let now = clock::now();
        let mut state = self.lock();

        if let Some(quota) = &state.quota {
            let wall = clock::wall_now();
            if quota.remaining < QUOTA_FLOOR && wall < quota.reset_at {
                let wait = (quota.reset_at - wall)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    + Duration::from_secs(self.config.quota_grace_secs);
                warn!(remaining = quota.remaining, "upstream quota nearly exhausted");
                state.stats.denied_admissions += 1;
                return Admission::RetryAfter(wait);
            }
        }

        let factor = state.throttle_factor;
        let mut worst_wait = Duration::ZERO;
        let mut denied = false;

        {
            let LimiterState {
                hourly,
                minute,
                burst,
                endpoints,
                ..
            } = &mut *state;
            let mut windows: Vec<&mut RateLimitWindow> = vec![hourly, minute, burst];
            if let Some(window) = endpoint.and_then(|name| endpoints.get_mut(name)) {
                windows.push(window);
            }

            for window in windows {
                let effective = if factor > THROTTLE_MIN {
                    (window.capacity() as f64 / factor).floor() as usize
                } else {
                    window.capacity()
                };
                if !window.has_slot(now, effective) {
                    denied = true;
                    worst_wait = worst_wait.max(window.time_until_slot(now));
                }
            }
        }

        if denied {
            state.stats.denied_admissions += 1;
            debug!(wait_ms = worst_wait.as_millis() as u64, "admission denied");
            Admission::RetryAfter(worst_wait)
        } else {
            Admission::Admitted
        }
    }

    /// Record a request in every applicable window and update adaptive
    /// state. Never fails.
    pub fn record(&self, endpoint: Option<&str>, outcome: RequestOutcome) {
        let now = clock::now();
        let mut state = self.lock();

        state.hourly.push(now);
        state.minute.push(now);
        state.burst.push(now);

        if let Some(name) = endpoint {
            let capacity = self.config.endpoint_capacity;
            state
                .endpoints
                .entry(name.to_string())
                .or_insert_with(|| RateLimitWindow::new(Duration::from_secs(60), capacity))
                .push(now);
        }

        state.stats.total_requests += 1;

        match outcome {
            RequestOutcome::RateLimited => {
                state.consecutive_rate_limits += 1;
                state.last_rate_limit = Some(now);
                state.stats.rate_limited_failures += 1;
                state.throttle_factor = (state.throttle_factor * 1.5).min(THROTTLE_MAX);
                warn!(
                    consecutive = state.consecutive_rate_limits,
                    throttle_factor = state.throttle_factor,
                    "downstream rate limit recorded"
                );
            }
            RequestOutcome::Success => {
                if state.consecutive_rate_limits > 0 {
                    let quiet = state
                        .last_rate_limit
                        .map(|last| now.duration_since(last))
                        .unwrap_or(Duration::MAX);
                    if quiet >= THROTTLE_DECAY_AFTER {
                        state.consecutive_rate_limits = 0;
                        state.throttle_factor =
                            (state.throttle_factor * 0.95).max(THROTTLE_MIN);
                    }
                }
            }
            RequestOutcome::Failed => {}
        }
    }

    /// Update the externally observed upstream quota and nudge the throttle
    /// factor from its usage ratio.
    pub fn update_upstream_quota(&self, limit: u64, remaining: u64, reset_at: DateTime<Utc>, used: u64) {
        let mut state = self.lock();

        let usage = if limit > 0 {
            used as f64 / limit as f64
        } else {
            0.0
        };
        if usage > 0.9 {
            state.throttle_factor = state.throttle_factor.max(2.0);
        } else if usage > 0.8 {
            state.throttle_factor = state.throttle_factor.max(1.5);
        } else if usage < 0.5 {
            state.throttle_factor = (state.throttle_factor * 0.9).max(THROTTLE_MIN);
        }

        debug!(remaining, limit, usage, throttle_factor = state.throttle_factor, "upstream quota updated");

        state.quota = Some(UpstreamQuota {
            limit,
            remaining,
            reset_at,
            used,
            updated_at: clock::wall_now(),
        });
    }

    /// Suspend until `admit` succeeds or the wait budget runs out.
    ///
    /// `max_wait` of zero degenerates to a single `admit` check.
    pub async fn wait_until_admitted(
        &self,
        endpoint: Option<&str>,
        max_wait: Duration,
    ) -> Result<()> {
        let mut waited = Duration::ZERO;

        loop {
            let hint = match self.admit(endpoint) {
                Admission::Admitted => {
                    if !waited.is_zero() {
                        self.lock().stats.total_wait_ms += waited.as_millis() as u64;
                    }
                    return Ok(());
                }
                Admission::RetryAfter(hint) => hint,
            };

            let sleep_for = hint.max(Duration::from_millis(50)).min(MAX_SINGLE_WAIT);
            if waited + sleep_for > max_wait {
                warn!(
                    waited_ms = waited.as_millis() as u64,
                    max_wait_ms = max_wait.as_millis() as u64,
                    "admission wait budget exceeded"
                );
                return Err(Error::wait_budget_exceeded(max_wait.as_millis() as u64));
            }

            info!(sleep_ms = sleep_for.as_millis() as u64, "rate limited, waiting");
            tokio::time::sleep(sleep_for).await;
            waited += sleep_for;
        }
    }

    /// Force a conservative throttle, or reset to normal.
    pub fn set_conservative_mode(&self, enabled: bool) {
        let mut state = self.lock();
        if enabled {
            state.throttle_factor = state.throttle_factor.max(2.0);
            info!("conservative rate limiting enabled");
        } else {
            state.throttle_factor = THROTTLE_MIN;
            state.consecutive_rate_limits = 0;
            info!("conservative rate limiting disabled");
        }
    }

    /// Current throttle factor.
    pub fn throttle_factor(&self) -> f64 {
        self.lock().throttle_factor
    }

    /// Point-in-time status snapshot.
    pub fn status(&self) -> RateLimiterStatus {
        let now = clock::now();
        let mut state = self.lock();

        let usage = |window: &mut RateLimitWindow, now: Instant| WindowUsage {
            current: window.count(now),
            capacity: window.capacity(),
        };

        let hourly = usage(&mut state.hourly, now);
        let minute = usage(&mut state.minute, now);
        let burst = usage(&mut state.burst, now);
        let endpoints = state
            .endpoints
            .iter_mut()
            .map(|(name, window)| (name.clone(), usage(window, now)))
            .collect();

        RateLimiterStatus {
            hourly,
            minute,
            burst,
            endpoints,
            throttle_factor: state.throttle_factor,
            consecutive_rate_limits: state.consecutive_rate_limits,
            quota: state.quota.clone(),
            stats: state.stats,
        }
    }
}
