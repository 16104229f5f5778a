use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use llmgate_provider_core::{Channel, ChannelLoadBalance, ChannelStatus, Proto, ServiceType};

use crate::state::ProviderRuntime;

/// The disjoint pool of channels a given client-facing wire protocol may
/// route into. `OpenaiChat`/`OpenaiOauth` channels answer the same
/// Responses-shaped traffic as `Responses` channels once the transform layer
/// has converted the request, so all three share one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFamily {
    Claude,
    Responses,
    Gemini,
}

impl ApiFamily {
    pub fn from_proto(proto: Proto) -> Self {
        match proto {
            Proto::Claude => ApiFamily::Claude,
            Proto::OpenAIChat | Proto::OpenAIResponse => ApiFamily::Responses,
            Proto::Gemini => ApiFamily::Gemini,
        }
    }

    fn matches(self, service_type: ServiceType) -> bool {
        match self {
            ApiFamily::Claude => service_type == ServiceType::Claude,
            ApiFamily::Gemini => service_type == ServiceType::Gemini,
            ApiFamily::Responses => matches!(
                service_type,
                ServiceType::Responses | ServiceType::OpenaiOauth | ServiceType::OpenaiChat
            ),
        }
    }
}

pub struct SelectInput<'a> {
    pub api_family: ApiFamily,
    pub model: Option<&'a str>,
    pub failed_channels: &'a [String],
    pub allowed_channels: &'a [String],
    /// Client/session identifier used by `channel_load_balance = session_affinity`.
    /// Advisory only: a miss or an unavailable remembered channel just falls
    /// back to ordinary selection.
    pub session_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub channel_id: String,
    /// Set when a composite's `rewrite_model` applies; the caller should
    /// substitute this for the client-requested model before forwarding.
    pub resolved_model: Option<String>,
    /// Remaining composite-mapping matches, in order. On failure of
    /// `channel_id`, the caller should try these before re-entering the
    /// scheduler, keeping the request inside the composite it landed in.
    pub failover_chain: Vec<String>,
    /// The id of the composite channel this selection was resolved from, if
    /// any. The caller marks this (not the resolved target) as failed once
    /// `failover_chain` is exhausted, so the scheduler does not hand back the
    /// same composite next round.
    pub composite_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    /// The caller's `allowed_channels` allow-list names no configured
    /// channel at all — a key scoping error, distinct from every configured
    /// channel simply being unavailable right now.
    NoAllowedChannels,
    /// A composite channel was the only schedulable candidate but none of
    /// its `composite_mappings` patterns matched the requested model.
    NoMatchingComposite,
    /// No schedulable channel remains for this request.
    NoChannelAvailable,
}

/// Remembers the last channel a session landed on, so repeat requests from
/// the same client tend to stick with it (cache affinity on the upstream
/// side, session-scoped conversational state, etc). Purely advisory and
/// self-cleaning: entries older than `TTL` are treated as absent.
const AFFINITY_TTL: Duration = Duration::from_secs(600);

#[derive(Default)]
pub struct SessionAffinityTable {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl SessionAffinityTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, session_id: &str) -> Option<String> {
        let mut guard = self.entries.lock().expect("affinity table mutex poisoned");
        match guard.get(session_id) {
            Some((channel_id, at)) if at.elapsed() < AFFINITY_TTL => Some(channel_id.clone()),
            Some(_) => {
                guard.remove(session_id);
                None
            }
            None => None,
        }
    }

    fn set(&self, session_id: &str, channel_id: &str) {
        let mut guard = self.entries.lock().expect("affinity table mutex poisoned");
        guard.insert(session_id.to_string(), (channel_id.to_string(), Instant::now()));
    }
}

/// Picks the next channel to send a request to, given everything already
/// tried this request. Callers re-invoke this after each exhausted channel
/// with an updated `failed_channels`, rather than the scheduler holding any
/// state of its own beyond the shared `affinity` table.
pub fn select_channel(
    providers: &HashMap<String, Arc<ProviderRuntime>>,
    input: &SelectInput<'_>,
    affinity: &SessionAffinityTable,
) -> Result<Selection, SelectError> {
    if !input.allowed_channels.is_empty()
        && !input
            .allowed_channels
            .iter()
            .any(|id| providers.contains_key(id))
    {
        return Err(SelectError::NoAllowedChannels);
    }

    let mut candidates: Vec<(Channel, Arc<ProviderRuntime>)> = providers
        .values()
        .filter_map(|runtime| {
            let value = runtime.config_json.load().as_ref().clone();
            let channel: Channel = serde_json::from_value(value).ok()?;
            Some((channel, runtime.clone()))
        })
        .filter(|(c, _)| c.status == ChannelStatus::Active)
        .filter(|(c, _)| !c.is_misconfigured())
        .filter(|(c, _)| !input.failed_channels.iter().any(|id| id == &c.id))
        .filter(|(c, _)| {
            input.allowed_channels.is_empty()
                || input.allowed_channels.iter().any(|id| id == &c.id)
        })
        .filter(|(c, _)| c.service_type == ServiceType::Composite || input.api_family.matches(c.service_type))
        .filter(|(_, rt)| rt.health.is_available())
        .collect();

    candidates.sort_by(|(a, _), (b, _)| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

    let winner = pick_winner(candidates, input, affinity)?;

    if winner.service_type != ServiceType::Composite {
        if let Some(session_id) = input.session_id {
            affinity.set(session_id, &winner.id);
        }
        return Ok(Selection {
            channel_id: winner.id,
            resolved_model: input.model.map(|m| m.to_string()),
            failover_chain: Vec::new(),
            composite_id: None,
        });
    }

    resolve_composite(&winner, input.model)
}

/// Among channels tied on the lowest `priority`, applies `channel_load_balance`.
/// Priority is still the primary sort key: a lower-priority channel always
/// wins outright, these strategies only break ties within the winning tier.
fn pick_winner(
    candidates: Vec<(Channel, Arc<ProviderRuntime>)>,
    input: &SelectInput<'_>,
    affinity: &SessionAffinityTable,
) -> Result<Channel, SelectError> {
    let mut candidates = candidates;
    if candidates.is_empty() {
        return Err(SelectError::NoChannelAvailable);
    }
    let top_priority = candidates[0].0.priority;
    let tie_len = candidates
        .iter()
        .take_while(|(c, _)| c.priority == top_priority)
        .count();
    if tie_len <= 1 {
        return Ok(candidates.remove(0).0);
    }
    let tier = &candidates[..tie_len];
    let strategy = tier[0].0.channel_load_balance;

    if strategy == ChannelLoadBalance::SessionAffinity
        && let Some(session_id) = input.session_id
        && let Some(remembered) = affinity.get(session_id)
        && let Some(pos) = tier.iter().position(|(c, _)| c.id == remembered)
    {
        return Ok(candidates.remove(pos).0);
    }

    let idx = match strategy {
        ChannelLoadBalance::Priority | ChannelLoadBalance::SessionAffinity => 0,
        ChannelLoadBalance::RoundRobin => {
            let counter = tier[0].1.round_robin_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            counter % tie_len
        }
        ChannelLoadBalance::Weighted => {
            let total_weight: u64 = tier.iter().map(|(c, _)| c.weight.max(1) as u64).sum();
            let mut pick = rand::rng().random_range(0..total_weight);
            let mut chosen = 0;
            for (i, (c, _)) in tier.iter().enumerate() {
                let w = c.weight.max(1) as u64;
                if pick < w {
                    chosen = i;
                    break;
                }
                pick -= w;
            }
            chosen
        }
    };
    Ok(candidates.remove(idx).0)
}

fn resolve_composite(channel: &Channel, model: Option<&str>) -> Result<Selection, SelectError> {
    let model = model.ok_or(SelectError::NoMatchingComposite)?;
    let model_lower = model.to_ascii_lowercase();

    let mut matches = channel
        .composite_mappings
        .iter()
        .filter(|m| model_lower.contains(&m.pattern.to_ascii_lowercase()));

    let first = matches.next().ok_or(SelectError::NoMatchingComposite)?;
    let failover_chain: Vec<String> = matches.map(|m| m.target_channel_id.clone()).collect();

    Ok(Selection {
        channel_id: first.target_channel_id.clone(),
        resolved_model: Some(
            first
                .rewrite_model
                .clone()
                .unwrap_or_else(|| model.to_string()),
        ),
        failover_chain,
        composite_id: Some(channel.id.clone()),
    })
}

/// Applies a channel's `model_mapping` prefix-rewrite rules, if any, to a
/// model name. Returns the rewritten name, or `None` if nothing matched.
pub fn apply_model_mapping(channel: &Channel, model: &str) -> Option<String> {
    channel
        .model_mapping
        .iter()
        .find(|m| model.starts_with(m.from_prefix.as_str()))
        .map(|m| format!("{}{}", m.to_prefix, &model[m.from_prefix.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_swap::ArcSwap;
    use llmgate_provider_core::{CompositeMapping, EventHub, ModelMapping};

    fn runtime_for(channel: serde_json::Value) -> Arc<ProviderRuntime> {
        let events = EventHub::new(16);
        Arc::new(ProviderRuntime::new(
            channel["id"].as_str().unwrap().to_string(),
            ArcSwap::from_pointee(channel),
            llmgate_provider_core::CredentialPool::new(events),
        ))
    }

    fn providers(channels: Vec<serde_json::Value>) -> HashMap<String, Arc<ProviderRuntime>> {
        channels
            .into_iter()
            .map(|c| {
                let id = c["id"].as_str().unwrap().to_string();
                (id, runtime_for(c))
            })
            .collect()
    }

    fn input<'a>(
        api_family: ApiFamily,
        model: Option<&'a str>,
        failed_channels: &'a [String],
        allowed_channels: &'a [String],
    ) -> SelectInput<'a> {
        SelectInput {
            api_family,
            model,
            failed_channels,
            allowed_channels,
            session_id: None,
        }
    }

    #[test]
    fn picks_lowest_priority_then_id() {
        let map = providers(vec![
            serde_json::json!({"id": "b", "service_type": "claude", "base_url": "https://b", "api_keys": [{"api_key": "k"}], "priority": 1}),
            serde_json::json!({"id": "a", "service_type": "claude", "base_url": "https://a", "api_keys": [{"api_key": "k"}], "priority": 1}),
            serde_json::json!({"id": "z", "service_type": "claude", "base_url": "https://z", "api_keys": [{"api_key": "k"}], "priority": 0}),
        ]);
        let affinity = SessionAffinityTable::new();
        let sel = select_channel(
            &map,
            &input(ApiFamily::Claude, Some("claude-3-5-haiku-20241022"), &[], &[]),
            &affinity,
        )
        .unwrap();
        assert_eq!(sel.channel_id, "z");
    }

    #[test]
    fn excludes_failed_channels() {
        let map = providers(vec![
            serde_json::json!({"id": "a", "service_type": "gemini", "base_url": "https://a", "api_keys": [{"api_key": "k"}], "priority": 0}),
            serde_json::json!({"id": "b", "service_type": "gemini", "base_url": "https://b", "api_keys": [{"api_key": "k"}], "priority": 1}),
        ]);
        let affinity = SessionAffinityTable::new();
        let failed = vec!["a".to_string()];
        let sel = select_channel(
            &map,
            &input(ApiFamily::Gemini, Some("gemini-2.0-flash"), &failed, &[]),
            &affinity,
        )
        .unwrap();
        assert_eq!(sel.channel_id, "b");
    }

    #[test]
    fn disjoint_allow_list_is_a_config_error_not_unavailability() {
        let map = providers(vec![
            serde_json::json!({"id": "a", "service_type": "gemini", "base_url": "https://a", "api_keys": [{"api_key": "k"}], "priority": 0}),
        ]);
        let affinity = SessionAffinityTable::new();
        let allowed = vec!["c".to_string()];
        let err = select_channel(
            &map,
            &input(ApiFamily::Gemini, Some("gemini-2.0-flash"), &[], &allowed),
            &affinity,
        )
        .unwrap_err();
        assert_eq!(err, SelectError::NoAllowedChannels);
    }

    #[test]
    fn resolves_composite_and_builds_failover_chain() {
        let map = providers(vec![serde_json::json!({
            "id": "router",
            "service_type": "composite",
            "priority": 0,
            "composite_mappings": [
                {"pattern": "opus", "target_channel_id": "anthropic-direct"},
                {"pattern": "opus", "target_channel_id": "anthropic-backup", "rewrite_model": "claude-opus-4-1-20250805"},
            ],
        })]);
        let affinity = SessionAffinityTable::new();
        let sel = select_channel(
            &map,
            &input(ApiFamily::Claude, Some("claude-opus-4-1-20250805"), &[], &[]),
            &affinity,
        )
        .unwrap();
        assert_eq!(sel.channel_id, "anthropic-direct");
        assert_eq!(sel.composite_id, Some("router".to_string()));
        assert_eq!(sel.failover_chain, vec!["anthropic-backup".to_string()]);
    }

    #[test]
    fn composite_with_no_matching_pattern_is_unroutable() {
        let channel: Channel = serde_json::from_value(serde_json::json!({
            "id": "router",
            "service_type": "composite",
            "composite_mappings": [
                {"pattern": "opus", "target_channel_id": "anthropic-direct"},
            ],
        }))
        .unwrap();
        let err = resolve_composite(&channel, Some("claude-3-5-haiku")).unwrap_err();
        assert_eq!(err, SelectError::NoMatchingComposite);
    }

    #[test]
    fn model_mapping_rewrites_matching_prefix() {
        let channel: Channel = serde_json::from_value(serde_json::json!({
            "id": "c",
            "service_type": "openai_chat",
            "model_mapping": [{"from_prefix": "gpt-", "to_prefix": "openai/gpt-"}],
        }))
        .unwrap();
        assert_eq!(
            apply_model_mapping(&channel, "gpt-4o"),
            Some("openai/gpt-4o".to_string())
        );
        assert_eq!(apply_model_mapping(&channel, "claude-3"), None);
    }

    #[test]
    fn round_robin_rotates_among_tied_priority_channels() {
        let map = providers(vec![
            serde_json::json!({"id": "a", "service_type": "claude", "base_url": "https://a", "api_keys": [{"api_key": "k"}], "priority": 0, "channel_load_balance": "round_robin"}),
            serde_json::json!({"id": "b", "service_type": "claude", "base_url": "https://b", "api_keys": [{"api_key": "k"}], "priority": 0, "channel_load_balance": "round_robin"}),
        ]);
        let affinity = SessionAffinityTable::new();
        let mut seen = Vec::new();
        for _ in 0..4 {
            let sel = select_channel(
                &map,
                &input(ApiFamily::Claude, Some("claude-3-5-haiku"), &[], &[]),
                &affinity,
            )
            .unwrap();
            seen.push(sel.channel_id);
        }
        assert_eq!(seen, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn session_affinity_sticks_to_the_remembered_channel() {
        let map = providers(vec![
            serde_json::json!({"id": "a", "service_type": "claude", "base_url": "https://a", "api_keys": [{"api_key": "k"}], "priority": 0, "channel_load_balance": "session_affinity"}),
            serde_json::json!({"id": "b", "service_type": "claude", "base_url": "https://b", "api_keys": [{"api_key": "k"}], "priority": 0, "channel_load_balance": "session_affinity"}),
        ]);
        let affinity = SessionAffinityTable::new();
        let mut sess = SelectInput {
            api_family: ApiFamily::Claude,
            model: Some("claude-3-5-haiku"),
            failed_channels: &[],
            allowed_channels: &[],
            session_id: Some("session-1"),
        };
        let first = select_channel(&map, &sess, &affinity).unwrap().channel_id;
        for _ in 0..5 {
            sess.session_id = Some("session-1");
            let again = select_channel(&map, &sess, &affinity).unwrap().channel_id;
            assert_eq!(again, first);
        }
    }

    #[test]
    fn open_circuit_excludes_a_channel_until_it_recovers() {
        let map = providers(vec![
            serde_json::json!({"id": "a", "service_type": "claude", "base_url": "https://a", "api_keys": [{"api_key": "k"}], "priority": 0}),
            serde_json::json!({"id": "b", "service_type": "claude", "base_url": "https://b", "api_keys": [{"api_key": "k"}], "priority": 1}),
        ]);
        for _ in 0..3 {
            map["a"].health.record_failure(llmgate_provider_core::FailoverReason::Transient5xx);
        }
        let affinity = SessionAffinityTable::new();
        let sel = select_channel(
            &map,
            &input(ApiFamily::Claude, Some("claude-3-5-haiku"), &[], &[]),
            &affinity,
        )
        .unwrap();
        assert_eq!(sel.channel_id, "b");
    }
}
