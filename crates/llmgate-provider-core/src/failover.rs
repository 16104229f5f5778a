//! Failover decision engine: turns an upstream failure (or a synthesized
//! one, for in-band content filtering) into a structured decision the
//! dispatch pipeline can act on, instead of a single cooldown duration.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Channel;
use crate::credential::UnavailableReason;
use crate::headers::{Headers, header_get};
use crate::provider::{UpstreamFailure, UpstreamTransportErrorKind};

const SOFT_RATE_LIMIT_WAIT_SECS: u64 = 2;
const SOFT_RATE_LIMIT_MAX_ATTEMPTS: u32 = 3;
const TRANSIENT_WAIT_SECS: u64 = 2;
const TRANSIENT_MAX_ATTEMPTS: u32 = 3;

const QUOTA_BODY_PATTERNS: &[&str] = &[
    "insufficient_quota",
    "quota_exceeded",
    "exceeded your current quota",
    "billing_hard_limit_reached",
    "you have exceeded your quota",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    RetrySameKey,
    FailoverKey,
    SuspendChannel,
    ReturnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverReason {
    QuotaExceeded,
    RateLimitSoft,
    AuthFailed,
    Transient5xx,
    ContentFilter,
    CircuitOpen,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverDecision {
    pub action: FailoverAction,
    pub wait: Duration,
    pub max_attempts: u32,
    pub reason: FailoverReason,
    pub mark_key_failed: bool,
    pub deprioritize_key: bool,
    pub suspend_channel: bool,
}

impl FailoverDecision {
    fn return_error(reason: FailoverReason) -> Self {
        Self {
            action: FailoverAction::ReturnError,
            wait: Duration::ZERO,
            max_attempts: 0,
            reason,
            mark_key_failed: false,
            deprioritize_key: false,
            suspend_channel: false,
        }
    }
}

/// Classifies an upstream failure against one channel's policy. Ordered the
/// way §4.3 reads: quota body match, then soft rate limit, then auth,
/// then transient 5xx/transport, then a catch-all return_error.
///
/// Content-filter matches never reach this function directly — the caller
/// detects a 2xx body matching `channel.content_filter.keywords`, synthesizes
/// an `UpstreamFailure::Http` with `channel.content_filter.mapped_status`,
/// and calls this same function so one set of rules governs both paths.
pub fn classify_failure(channel: &Channel, failure: &UpstreamFailure) -> FailoverDecision {
    match failure {
        UpstreamFailure::Http {
            status,
            headers,
            body,
        } => {
            if body_matches_quota_pattern(body) {
                return FailoverDecision {
                    action: FailoverAction::SuspendChannel,
                    wait: Duration::ZERO,
                    max_attempts: 0,
                    reason: FailoverReason::QuotaExceeded,
                    mark_key_failed: false,
                    deprioritize_key: false,
                    suspend_channel: true,
                };
            }
            if *status == channel.content_filter.mapped_status && channel.content_filter.enabled {
                return FailoverDecision {
                    action: FailoverAction::FailoverKey,
                    wait: Duration::ZERO,
                    max_attempts: 1,
                    reason: FailoverReason::ContentFilter,
                    mark_key_failed: false,
                    deprioritize_key: false,
                    suspend_channel: false,
                };
            }
            if *status == 429 {
                let wait = parse_retry_after(headers)
                    .unwrap_or_else(|| Duration::from_secs(SOFT_RATE_LIMIT_WAIT_SECS));
                return FailoverDecision {
                    action: FailoverAction::RetrySameKey,
                    wait,
                    max_attempts: SOFT_RATE_LIMIT_MAX_ATTEMPTS,
                    reason: FailoverReason::RateLimitSoft,
                    mark_key_failed: false,
                    deprioritize_key: true,
                    suspend_channel: false,
                };
            }
            if *status == 401 || *status == 403 {
                return FailoverDecision {
                    action: FailoverAction::FailoverKey,
                    wait: Duration::ZERO,
                    max_attempts: 1,
                    reason: FailoverReason::AuthFailed,
                    mark_key_failed: true,
                    deprioritize_key: false,
                    suspend_channel: false,
                };
            }
            if (500..600).contains(status) {
                return FailoverDecision {
                    action: FailoverAction::FailoverKey,
                    wait: Duration::from_secs(TRANSIENT_WAIT_SECS),
                    max_attempts: TRANSIENT_MAX_ATTEMPTS,
                    reason: FailoverReason::Transient5xx,
                    mark_key_failed: false,
                    deprioritize_key: true,
                    suspend_channel: false,
                };
            }
            FailoverDecision::return_error(FailoverReason::Other)
        }
        UpstreamFailure::Transport { kind, .. } => match kind {
            UpstreamTransportErrorKind::Timeout
            | UpstreamTransportErrorKind::ReadTimeout
            | UpstreamTransportErrorKind::Connect
            | UpstreamTransportErrorKind::Dns
            | UpstreamTransportErrorKind::Tls => FailoverDecision {
                action: FailoverAction::FailoverKey,
                wait: Duration::from_secs(TRANSIENT_WAIT_SECS),
                max_attempts: TRANSIENT_MAX_ATTEMPTS,
                reason: FailoverReason::Transient5xx,
                mark_key_failed: false,
                deprioritize_key: true,
                suspend_channel: false,
            },
            UpstreamTransportErrorKind::Other => FailoverDecision::return_error(FailoverReason::Other),
        },
    }
}

/// The decision to hand back when `ChannelHealth` has already tripped the
/// circuit for a channel — skips classification entirely.
pub fn circuit_open_decision() -> FailoverDecision {
    FailoverDecision::return_error(FailoverReason::CircuitOpen)
}

/// How a credential-level cooldown reason maps onto the channel-level
/// breaker's bookkeeping when `FailoverDecision.deprioritize_key` or
/// `mark_key_failed` is set.
impl From<FailoverReason> for UnavailableReason {
    fn from(reason: FailoverReason) -> Self {
        match reason {
            FailoverReason::QuotaExceeded | FailoverReason::RateLimitSoft => UnavailableReason::RateLimit,
            FailoverReason::AuthFailed => UnavailableReason::AuthInvalid,
            FailoverReason::Transient5xx => UnavailableReason::Upstream5xx,
            FailoverReason::ContentFilter => UnavailableReason::ModelDisallow,
            FailoverReason::CircuitOpen | FailoverReason::Other => UnavailableReason::Unknown,
        }
    }
}

fn body_matches_quota_pattern(body: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    let lower = text.to_ascii_lowercase();
    QUOTA_BODY_PATTERNS.iter().any(|p| lower.contains(p))
}

fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?;
    let secs = value.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

/// Per-channel circuit breaker (§9's `ChannelHealth`), symmetric to the
/// per-credential cooldowns `CredentialPool` already tracks. Three
/// consecutive non-transient failures inside a 60s window open the circuit
/// for 30s; a success while half-open closes it, a failure re-opens it.
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const OPEN_DURATION: Duration = Duration::from_secs(30);
const FAILURE_THRESHOLD: u32 = 3;
/// `FailoverDecision::suspend_channel` trips the breaker outright rather than
/// counting toward the threshold — a quota-exhausted channel needs longer
/// than 30s to plausibly recover.
const SUSPEND_DURATION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

struct HealthInner {
    state: BreakerState,
    consecutive_failures: u32,
    window_start: Option<Instant>,
}

pub struct ChannelHealth {
    inner: Mutex<HealthInner>,
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HealthInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window_start: None,
            }),
        }
    }
}

impl ChannelHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this channel should be excluded from scheduling right now.
    /// Flips `Open -> HalfOpen` once the cooldown elapses so the next
    /// candidate check lets exactly one trial request through.
    pub fn is_available(&self) -> bool {
        let mut guard = self.inner.lock().expect("channel health mutex poisoned");
        if let BreakerState::Open { until } = guard.state
            && Instant::now() >= until
        {
            guard.state = BreakerState::HalfOpen;
        }
        !matches!(guard.state, BreakerState::Open { .. })
    }

    /// A non-transient failure not caught by a transient classification
    /// (i.e. the dispatch pipeline decided to fail this channel over).
    pub fn record_failure(&self, reason: FailoverReason) {
        if matches!(reason, FailoverReason::RateLimitSoft) {
            // Soft rate limiting is expected traffic shaping, not a health signal.
            return;
        }
        let mut guard = self.inner.lock().expect("channel health mutex poisoned");
        let now = Instant::now();
        if matches!(guard.state, BreakerState::HalfOpen) {
            guard.state = BreakerState::Open {
                until: now + OPEN_DURATION,
            };
            guard.consecutive_failures = FAILURE_THRESHOLD;
            return;
        }
        match guard.window_start {
            Some(start) if now.duration_since(start) <= FAILURE_WINDOW => {
                guard.consecutive_failures += 1;
            }
            _ => {
                guard.window_start = Some(now);
                guard.consecutive_failures = 1;
            }
        }
        if guard.consecutive_failures >= FAILURE_THRESHOLD {
            guard.state = BreakerState::Open {
                until: now + OPEN_DURATION,
            };
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.inner.lock().expect("channel health mutex poisoned");
        guard.state = BreakerState::Closed;
        guard.consecutive_failures = 0;
        guard.window_start = None;
    }

    /// Trips the breaker immediately for `SUSPEND_DURATION`, bypassing the
    /// consecutive-failure count. Used for `FailoverDecision.suspend_channel`.
    pub fn suspend(&self) {
        let mut guard = self.inner.lock().expect("channel health mutex poisoned");
        guard.state = BreakerState::Open {
            until: Instant::now() + SUSPEND_DURATION,
        };
        guard.consecutive_failures = FAILURE_THRESHOLD;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_channel() -> Channel {
        serde_json::from_value(serde_json::json!({
            "id": "c1",
            "service_type": "claude",
            "base_url": "https://api.anthropic.com",
        }))
        .unwrap()
    }

    #[test]
    fn quota_body_suspends_channel() {
        let channel = test_channel();
        let failure = UpstreamFailure::Http {
            status: 400,
            headers: Vec::new(),
            body: Bytes::from_static(b"{\"error\":{\"message\":\"insufficient_quota\"}}"),
        };
        let decision = classify_failure(&channel, &failure);
        assert_eq!(decision.action, FailoverAction::SuspendChannel);
        assert!(decision.suspend_channel);
        assert_eq!(decision.reason, FailoverReason::QuotaExceeded);
    }

    #[test]
    fn soft_rate_limit_retries_same_key() {
        let channel = test_channel();
        let failure = UpstreamFailure::Http {
            status: 429,
            headers: vec![("retry-after".into(), "5".into())],
            body: Bytes::new(),
        };
        let decision = classify_failure(&channel, &failure);
        assert_eq!(decision.action, FailoverAction::RetrySameKey);
        assert_eq!(decision.wait, Duration::from_secs(5));
        assert_eq!(decision.max_attempts, SOFT_RATE_LIMIT_MAX_ATTEMPTS);
    }

    #[test]
    fn auth_failure_fails_over_and_marks_key_failed() {
        let channel = test_channel();
        let failure = UpstreamFailure::Http {
            status: 401,
            headers: Vec::new(),
            body: Bytes::new(),
        };
        let decision = classify_failure(&channel, &failure);
        assert_eq!(decision.action, FailoverAction::FailoverKey);
        assert!(decision.mark_key_failed);
        assert_eq!(decision.reason, FailoverReason::AuthFailed);
    }

    #[test]
    fn content_filter_status_reclassifies_as_content_filter() {
        let mut channel = test_channel();
        channel.content_filter.enabled = true;
        channel.content_filter.mapped_status = 451;
        let failure = UpstreamFailure::Http {
            status: 451,
            headers: Vec::new(),
            body: Bytes::new(),
        };
        let decision = classify_failure(&channel, &failure);
        assert_eq!(decision.reason, FailoverReason::ContentFilter);
        assert_eq!(decision.action, FailoverAction::FailoverKey);
    }

    #[test]
    fn unmatched_404_returns_error() {
        let channel = test_channel();
        let failure = UpstreamFailure::Http {
            status: 404,
            headers: Vec::new(),
            body: Bytes::new(),
        };
        let decision = classify_failure(&channel, &failure);
        assert_eq!(decision.action, FailoverAction::ReturnError);
    }

    #[test]
    fn circuit_opens_after_three_consecutive_failures() {
        let health = ChannelHealth::new();
        assert!(health.is_available());
        health.record_failure(FailoverReason::Transient5xx);
        health.record_failure(FailoverReason::Transient5xx);
        assert!(health.is_available());
        health.record_failure(FailoverReason::Transient5xx);
        assert!(!health.is_available());
    }

    #[test]
    fn success_in_half_open_closes_circuit() {
        let health = ChannelHealth::new();
        for _ in 0..3 {
            health.record_failure(FailoverReason::Transient5xx);
        }
        assert!(!health.is_available());
        // Simulate cooldown elapsed by constructing a fresh tracker at the
        // open boundary is not directly testable without sleeping; instead
        // verify that a success always closes regardless of prior state.
        health.record_success();
        assert!(health.is_available());
    }

    #[test]
    fn soft_rate_limit_does_not_trip_the_breaker() {
        let health = ChannelHealth::new();
        for _ in 0..10 {
            health.record_failure(FailoverReason::RateLimitSoft);
        }
        assert!(health.is_available());
    }

    #[test]
    fn suspend_trips_the_breaker_regardless_of_failure_count() {
        let health = ChannelHealth::new();
        assert!(health.is_available());
        health.suspend();
        assert!(!health.is_available());
    }

    #[test]
    fn failover_reason_maps_to_a_sensible_unavailable_reason() {
        assert_eq!(UnavailableReason::from(FailoverReason::AuthFailed), UnavailableReason::AuthInvalid);
        assert_eq!(UnavailableReason::from(FailoverReason::RateLimitSoft), UnavailableReason::RateLimit);
        assert_eq!(UnavailableReason::from(FailoverReason::Other), UnavailableReason::Unknown);
    }
}
