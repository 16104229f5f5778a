use std::sync::Arc;

use llmgate_provider_core::ProviderRegistry;

use crate::providers::GatewayProvider;

pub const BUILTIN_PROVIDER_NAME: &str = "gateway";

/// Registers the single generic provider that serves every channel
/// regardless of `serviceType`; there is one upstream shape per wire
/// protocol, not one implementation per vendor.
pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    registry.register(Arc::new(GatewayProvider::new()));
}
