//! Component G: tracks each channel's consumption against `quota_limit`,
//! independently of credential-level rate limiting. A channel that trips its
//! quota is not unavailable in the credential sense — every key on it may
//! still be healthy — so this is tracked per `channel.id` rather than folded
//! into `CredentialPool`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{Channel, QuotaType};
use crate::headers::{Headers, header_get};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuotaStatus {
    pub used: u64,
    pub limit: Option<u64>,
    pub is_exceeded: bool,
    pub exceeded_at: Option<i64>,
    pub recover_at: Option<i64>,
}

#[derive(Debug, Default, Clone)]
struct ChannelQuota {
    used: u64,
    exceeded_at: Option<i64>,
    recover_at: Option<i64>,
}

#[derive(Default)]
pub struct QuotaManager {
    state: RwLock<HashMap<String, ChannelQuota>>,
}

impl QuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_usage(&self, channel: &Channel, amount: u64) {
        if channel.quota_type == QuotaType::None {
            return;
        }
        let mut guard = self.state.write().expect("quota mutex poisoned");
        let entry = guard.entry(channel.id.clone()).or_default();
        maybe_reset(channel, entry);
        entry.used = entry.used.saturating_add(amount);
    }

    pub fn get_status(&self, channel: &Channel) -> QuotaStatus {
        let mut guard = self.state.write().expect("quota mutex poisoned");
        let entry = guard.entry(channel.id.clone()).or_default();
        maybe_reset(channel, entry);
        let is_exceeded =
            entry.exceeded_at.is_some() || channel.quota_limit.is_some_and(|limit| entry.used >= limit);
        QuotaStatus {
            used: entry.used,
            limit: channel.quota_limit,
            is_exceeded,
            exceeded_at: entry.exceeded_at,
            recover_at: entry.recover_at,
        }
    }

    /// Marks a channel as having hit its quota right now. `retry_after_secs`
    /// (from an upstream `Retry-After`) wins over the channel's own
    /// `quota_reset_at`/`quota_reset_interval_secs` when present.
    pub fn set_exceeded(&self, channel: &Channel, retry_after_secs: Option<u64>) {
        let mut guard = self.state.write().expect("quota mutex poisoned");
        let entry = guard.entry(channel.id.clone()).or_default();
        let now = now_unix();
        entry.exceeded_at = Some(now);
        entry.recover_at = retry_after_secs
            .map(|secs| now + secs as i64)
            .or(channel.quota_reset_at)
            .or_else(|| channel.quota_reset_interval_secs.map(|secs| now + secs as i64));
    }

    /// Reads `X-RateLimit-Remaining`/`X-RateLimit-Reset` off an upstream
    /// response and updates exceeded state if the provider reports zero
    /// remaining quota. A no-op when those headers are absent.
    pub fn update_from_headers(&self, channel: &Channel, headers: &Headers) {
        let Some(remaining) = header_get(headers, "x-ratelimit-remaining").and_then(|v| v.parse::<u64>().ok())
        else {
            return;
        };
        if remaining == 0 {
            let retry_after =
                header_get(headers, "x-ratelimit-reset").and_then(|v| v.parse::<u64>().ok());
            self.set_exceeded(channel, retry_after);
        }
    }

    pub fn clear_channel(&self, channel_id: &str) {
        self.state.write().expect("quota mutex poisoned").remove(channel_id);
    }
}

fn maybe_reset(channel: &Channel, entry: &mut ChannelQuota) {
    let Some(recover_at) = entry.recover_at else {
        return;
    };
    if recover_at <= now_unix() {
        entry.used = 0;
        entry.exceeded_at = None;
        entry.recover_at = None;
    }
    let _ = channel.quota_models.len();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(quota_type: &str, limit: Option<u64>) -> Channel {
        serde_json::from_value(serde_json::json!({
            "id": "c",
            "service_type": "claude",
            "quota_type": quota_type,
            "quota_limit": limit,
        }))
        .unwrap()
    }

    #[test]
    fn usage_accumulates_and_trips_limit() {
        let manager = QuotaManager::new();
        let channel = channel("requests", Some(3));
        manager.increment_usage(&channel, 1);
        manager.increment_usage(&channel, 1);
        assert!(!manager.get_status(&channel).is_exceeded);
        manager.increment_usage(&channel, 1);
        assert!(manager.get_status(&channel).is_exceeded);
    }

    #[test]
    fn quota_type_none_is_never_tracked() {
        let manager = QuotaManager::new();
        let channel = channel("none", Some(1));
        manager.increment_usage(&channel, 100);
        assert_eq!(manager.get_status(&channel).used, 0);
    }

    #[test]
    fn set_exceeded_without_retry_after_falls_back_to_channel_reset() {
        let manager = QuotaManager::new();
        let mut channel = channel("credit", Some(1));
        channel.quota_reset_at = Some(now_unix() + 3600);
        manager.set_exceeded(&channel, None);
        assert!(manager.get_status(&channel).is_exceeded);

        // Once the channel's configured reset time has passed, the next read clears it.
        channel.quota_reset_at = Some(now_unix() - 1);
        manager.set_exceeded(&channel, None);
        assert!(!manager.get_status(&channel).is_exceeded);
    }
}
