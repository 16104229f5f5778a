use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Proto;
use crate::credential::{ApiKeyCredential, OAuthTokens};

use super::ModelTable;

/// `channel.serviceType`: which wire family a channel speaks upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Claude,
    OpenaiChat,
    OpenaiOauth,
    Responses,
    Gemini,
    Composite,
}

impl ServiceType {
    /// The wire protocol this service type natively speaks. `None` for
    /// `Composite`, which holds no credentials and routes per-model to
    /// other channels instead of calling upstream directly.
    pub fn wire_proto(self) -> Option<Proto> {
        match self {
            ServiceType::Claude => Some(Proto::Claude),
            ServiceType::OpenaiChat => Some(Proto::OpenAIChat),
            ServiceType::OpenaiOauth | ServiceType::Responses => Some(Proto::OpenAIResponse),
            ServiceType::Gemini => Some(Proto::Gemini),
            ServiceType::Composite => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Active,
    Disabled,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyLoadBalance {
    #[default]
    Sequential,
    RoundRobin,
    Random,
    LeastRecentFailure,
}

/// How the scheduler picks among channels tied on nothing but being
/// schedulable for a request. `Priority` (the teacher's only mode) still
/// sorts by `priority`/`id` first; the other modes apply only among channels
/// sharing the lowest `priority` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLoadBalance {
    #[default]
    Priority,
    RoundRobin,
    Weighted,
    SessionAffinity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    #[default]
    None,
    Requests,
    Credit,
}

fn default_mapped_status() -> u16 {
    429
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentFilter {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_mapped_status")]
    pub mapped_status: u16,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self {
            enabled: false,
            keywords: Vec::new(),
            mapped_status: default_mapped_status(),
        }
    }
}

/// A prefix-rewrite rule applied to the client-requested model name before
/// the request is forwarded upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    pub from_prefix: String,
    pub to_prefix: String,
}

/// One entry of a composite channel's per-model routing table. Mappings are
/// tried in order; everything after the matched entry becomes the
/// `failover_chain` for that request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeMapping {
    pub pattern: String,
    pub target_channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_model: Option<String>,
}

fn default_response_header_timeout_secs() -> u64 {
    60
}

/// The central configuration entity: one upstream endpoint plus its
/// credentials, routing, and scheduling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    /// Position in the configured channel list; a telemetry label only,
    /// never used as a lookup key.
    #[serde(default)]
    pub index: u32,
    pub service_type: ServiceType,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_response_header_timeout_secs")]
    pub response_header_timeout_secs: u64,

    #[serde(default)]
    pub api_keys: Vec<ApiKeyCredential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_tokens: Option<OAuthTokens>,
    /// Token endpoint for refreshing `oauth_tokens`. Acquisition (the
    /// device-flow / authorization-code dance that first populates the
    /// token pair) is out of scope; this only backs refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_secret: Option<String>,
    #[serde(default)]
    pub key_load_balance: KeyLoadBalance,

    #[serde(default)]
    pub model_mapping: Vec<ModelMapping>,
    #[serde(default)]
    pub composite_mappings: Vec<CompositeMapping>,

    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub channel_load_balance: ChannelLoadBalance,
    /// Relative share for `channel_load_balance = weighted`. Zero is treated
    /// as 1 so a forgotten weight does not silently starve a channel.
    #[serde(default)]
    pub weight: u32,

    #[serde(default)]
    pub rate_limit_rpm: u32,
    #[serde(default)]
    pub queue_enabled: bool,
    #[serde(default)]
    pub queue_timeout_ms: u64,
    #[serde(default)]
    pub quota_type: QuotaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_reset_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_reset_interval_secs: Option<u64>,
    #[serde(default)]
    pub quota_models: Vec<String>,
    #[serde(default)]
    pub content_filter: ContentFilter,
    #[serde(default)]
    pub price_multipliers: HashMap<String, f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_table: Option<ModelTable>,
}

impl Channel {
    /// A non-composite, active channel with no way to authenticate upstream
    /// is unschedulable and must surface as a configuration error at
    /// selection time rather than being silently skipped.
    pub fn is_misconfigured(&self) -> bool {
        self.status == ChannelStatus::Active
            && self.service_type != ServiceType::Composite
            && self.api_keys.is_empty()
            && self.oauth_tokens.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_channel_without_credentials_is_schedulable() {
        let channel = Channel {
            id: "composite".into(),
            index: 0,
            service_type: ServiceType::Composite,
            base_url: String::new(),
            insecure_skip_verify: false,
            response_header_timeout_secs: default_response_header_timeout_secs(),
            api_keys: Vec::new(),
            oauth_tokens: None,
            oauth_token_url: None,
            oauth_client_id: None,
            oauth_client_secret: None,
            key_load_balance: KeyLoadBalance::default(),
            model_mapping: Vec::new(),
            composite_mappings: Vec::new(),
            status: ChannelStatus::Active,
            priority: 0,
            channel_load_balance: ChannelLoadBalance::default(),
            weight: 0,
            rate_limit_rpm: 0,
            queue_enabled: false,
            queue_timeout_ms: 0,
            quota_type: QuotaType::default(),
            quota_limit: None,
            quota_reset_at: None,
            quota_reset_interval_secs: None,
            quota_models: Vec::new(),
            content_filter: ContentFilter::default(),
            price_multipliers: HashMap::new(),
            model_table: None,
        };
        assert!(!channel.is_misconfigured());
    }

    #[test]
    fn claude_channel_without_credentials_is_misconfigured() {
        let mut channel = serde_json::from_value::<Channel>(serde_json::json!({
            "id": "c1",
            "service_type": "claude",
            "base_url": "https://api.anthropic.com",
        }))
        .unwrap();
        assert!(channel.is_misconfigured());
        channel.api_keys.push(ApiKeyCredential {
            api_key: "sk-test".into(),
        });
        assert!(!channel.is_misconfigured());
    }
}
