use tokio::time::Instant;

use serde::{Deserialize, Serialize};

pub type CredentialId = i64;

/// A key's availability has two independent tiers: `Deprioritized` is a
/// soft, TTL-bound cooldown (rate limits, transient 5xx) that the rotator
/// still falls back to once every non-deprioritized key is exhausted;
/// `Failed` is persistent (auth invalid, admin action) and excludes the key
/// from scheduling entirely until an operator clears it.
#[derive(Debug, Clone)]
pub enum CredentialState {
    Active,
    Deprioritized {
        until: Instant,
        reason: UnavailableReason,
    },
    Failed {
        reason: UnavailableReason,
    },
}

impl CredentialState {
    pub fn is_active(&self) -> bool {
        matches!(self, CredentialState::Active)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CredentialState::Failed { .. })
    }

    /// True once an expired deprioritization would let the key serve again.
    pub fn is_usable(&self, now: Instant) -> bool {
        match self {
            CredentialState::Active => true,
            CredentialState::Deprioritized { until, .. } => *until <= now,
            CredentialState::Failed { .. } => false,
        }
    }

    pub fn unavailable_until(&self) -> Option<Instant> {
        match self {
            CredentialState::Deprioritized { until, .. } => Some(*until),
            CredentialState::Active | CredentialState::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnavailableReason {
    RateLimit,
    Timeout,
    Upstream5xx,
    AuthInvalid,
    ModelDisallow,
    Manual,
    Unknown,
}
