//! Built-in upstream provider implementations.
//!
//! This crate does not perform network IO. It builds `UpstreamHttpRequest` for
//! upstream calls.

mod auth_extractor;
mod providers;
mod registry;

pub use providers::GatewayProvider;
pub use registry::{BUILTIN_PROVIDER_NAME, register_builtin_providers};
