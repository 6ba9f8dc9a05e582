//! Rate-limit arbiter.
//!
//! Tracks the agent service's availability. Worker-reported hits flip the
//! global `available` flag and schedule a resume deadline with exponential
//! backoff; a periodic probe (issued by the recovery loop) detects that
//! the limit has lifted. Availability changes are published over a watch
//! channel with a monotonically increasing epoch, so observers see
//! transitions in order.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::Config;

/// Why the agent service is (or was) unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    /// The session-hour allowance is exhausted.
    SessionLimit,
    /// A daily or monthly quota is exhausted.
    QuotaExceeded,
    /// Too many requests in a short window.
    RequestRate,
    /// Signature matched but the flavor is unclear.
    Unknown,
}

impl RateLimitReason {
    /// Infer the flavor of a rate limit from agent output.
    #[must_use]
    pub fn infer(output: &str) -> Self {
        let lower = output.to_lowercase();
        if lower.contains("5-hour") || lower.contains("session") {
            Self::SessionLimit
        } else if lower.contains("quota") {
            Self::QuotaExceeded
        } else if lower.contains("rate limit") || lower.contains("too many requests") {
            Self::RequestRate
        } else {
            Self::Unknown
        }
    }

    /// Returns the string representation of this reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SessionLimit => "session_limit",
            Self::QuotaExceeded => "quota_exceeded",
            Self::RequestRate => "request_rate",
            Self::Unknown => "unknown",
        }
    }
}

/// Snapshot of the arbiter's availability, published to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    /// Whether new work may dispatch.
    pub available: bool,

    /// When the current suspension is expected to lift.
    pub resume_at: Option<DateTime<Utc>>,

    /// Reason for the current suspension.
    pub reason: Option<RateLimitReason>,

    /// Monotonically increasing change counter.
    pub epoch: u64,
}

impl Availability {
    const fn initial() -> Self {
        Self {
            available: true,
            resume_at: None,
            reason: None,
            epoch: 0,
        }
    }
}

#[derive(Debug)]
struct ArbiterState {
    available: bool,
    resume_at: Option<DateTime<Utc>>,
    reason: Option<RateLimitReason>,
    consecutive_hits: u32,
    epoch: u64,
}

/// The rate-limit arbiter. Single-writer: all mutations funnel through
/// its methods; readers observe a monotonic view via [`subscribe`].
///
/// [`subscribe`]: RateLimitArbiter::subscribe
pub struct RateLimitArbiter {
    state: Mutex<ArbiterState>,
    tx: watch::Sender<Availability>,
    clock: SharedClock,
    base_wait_secs: u64,
    max_wait_secs: u64,
    multiplier: f64,
}

impl RateLimitArbiter {
    /// Build the arbiter from configuration.
    #[must_use]
    pub fn new(config: &Config, clock: SharedClock) -> Self {
        let (tx, _) = watch::channel(Availability::initial());
        Self {
            state: Mutex::new(ArbiterState {
                available: true,
                resume_at: None,
                reason: None,
                consecutive_hits: 0,
                epoch: 0,
            }),
            tx,
            clock,
            base_wait_secs: config.default_unban_wait_seconds,
            max_wait_secs: config.session_limit_seconds,
            multiplier: config.rate_limit_backoff_multiplier,
        }
    }

    /// Whether new work may dispatch right now.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state.lock().unwrap().available
    }

    /// The deadline the current suspension is expected to lift at.
    #[must_use]
    pub fn wait_until(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().resume_at
    }

    /// Number of consecutive hits without a successful probe.
    #[must_use]
    pub fn consecutive_hits(&self) -> u32 {
        self.state.lock().unwrap().consecutive_hits
    }

    /// Subscribe to availability changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Availability> {
        self.tx.subscribe()
    }

    /// Backoff for the given hit count, clamped to `[base, max]`.
    fn backoff_secs(&self, hits: u32) -> u64 {
        #[allow(clippy::cast_possible_wrap)] // hit counts stay tiny
        let raw = (self.base_wait_secs as f64) * self.multiplier.powi(hits as i32);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let secs = raw.min(self.max_wait_secs as f64) as u64;
        secs.max(self.base_wait_secs)
    }

    /// Record a worker-reported rate-limit hit.
    ///
    /// Sets `available = false` and schedules the resume deadline. A
    /// server-supplied `retry_after` hint overrides the computed backoff.
    /// Returns the scheduled deadline.
    pub fn record_hit(
        &self,
        reason: RateLimitReason,
        retry_after: Option<u64>,
    ) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        let wait = retry_after.unwrap_or_else(|| self.backoff_secs(state.consecutive_hits));
        let resume_at = now + Duration::seconds(i64::try_from(wait).unwrap_or(i64::MAX));

        // Never shorten an already-scheduled deadline on a repeat hit.
        let resume_at = match state.resume_at {
            Some(existing) if existing > resume_at => existing,
            _ => resume_at,
        };

        state.available = false;
        state.resume_at = Some(resume_at);
        state.reason = Some(reason);
        state.consecutive_hits += 1;
        warn!(
            reason = reason.as_str(),
            consecutive_hits = state.consecutive_hits,
            resume_at = %resume_at,
            "rate limit hit, pausing dispatch"
        );
        Self::publish(&self.tx, &mut state);
        resume_at
    }

    /// Whether a probe should be issued now.
    #[must_use]
    pub fn probe_due(&self) -> bool {
        let state = self.state.lock().unwrap();
        match (state.available, state.resume_at) {
            (false, Some(resume_at)) => self.clock.now() >= resume_at,
            (false, None) => true,
            _ => false,
        }
    }

    /// Record a successful probe: the limit has lifted.
    pub fn record_probe_success(&self) {
        let mut state = self.state.lock().unwrap();
        if state.available {
            return;
        }
        info!("probe succeeded, agent service available again");
        state.available = true;
        state.resume_at = None;
        state.reason = None;
        state.consecutive_hits = 0;
        Self::publish(&self.tx, &mut state);
    }

    /// Record a failed probe: extend the deadline, touch nothing else.
    /// Probe failures never affect tasks.
    pub fn record_probe_failure(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        if state.available {
            return;
        }
        let wait = self.backoff_secs(state.consecutive_hits);
        let resume_at = now + Duration::seconds(i64::try_from(wait).unwrap_or(i64::MAX));
        state.resume_at = Some(resume_at);
        info!(resume_at = %resume_at, "probe failed, extending wait");
        Self::publish(&self.tx, &mut state);
    }

    fn publish(tx: &watch::Sender<Availability>, state: &mut ArbiterState) {
        state.epoch += 1;
        let _ = tx.send(Availability {
            available: state.available,
            resume_at: state.resume_at,
            reason: state.reason,
            epoch: state.epoch,
        });
    }
}
