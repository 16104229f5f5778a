//! Per-request cost lookup, used to bill `quota_type = credit` channels and
//! to populate the cost fields of a request log.

use crate::config::Channel;

pub trait PricingLookup: Send + Sync {
    /// Cost of one completed request, in the channel's credit unit.
    fn price(&self, channel: &Channel, model: &str, input_tokens: u64, output_tokens: u64) -> f64;
}

/// Flat per-million-token rate, scaled by `channel.price_multipliers[model]`
/// (default 1.0 when the model has no entry).
#[derive(Debug, Clone, Copy)]
pub struct FlatRatePricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for FlatRatePricing {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
        }
    }
}

impl PricingLookup for FlatRatePricing {
    fn price(&self, channel: &Channel, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let multiplier = channel.price_multipliers.get(model).copied().unwrap_or(1.0);
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_per_million;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_per_million;
        (input_cost + output_cost) * multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn channel_with_multiplier(model: &str, multiplier: f64) -> Channel {
        let mut channel: Channel = serde_json::from_value(serde_json::json!({
            "id": "c",
            "service_type": "claude",
        }))
        .unwrap();
        let mut map = HashMap::new();
        map.insert(model.to_string(), multiplier);
        channel.price_multipliers = map;
        channel
    }

    #[test]
    fn flat_rate_applies_model_multiplier() {
        let pricing = FlatRatePricing::default();
        let channel = channel_with_multiplier("claude-opus-4-1-20250805", 2.0);
        let base = pricing.price(&channel, "unknown-model", 1_000_000, 0);
        let doubled = pricing.price(&channel, "claude-opus-4-1-20250805", 1_000_000, 0);
        assert_eq!(doubled, base * 2.0);
    }

    #[test]
    fn missing_multiplier_defaults_to_one() {
        let pricing = FlatRatePricing::default();
        let channel = channel_with_multiplier("other-model", 5.0);
        let cost = pricing.price(&channel, "claude-3-5-haiku-20241022", 1_000_000, 1_000_000);
        assert_eq!(cost, pricing.input_per_million + pricing.output_per_million);
    }
}
