//! Core provider abstractions for llmgate.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP client.
//! Provider implementations should construct `UpstreamHttpRequest` (and optional
//! internal requests like `upstream_usage`), while a higher layer performs IO.

pub mod config;
pub mod credential;
pub mod errors;
pub mod events;
pub mod failover;
pub mod headers;
pub mod identity;
pub mod pricing;
pub mod provider;
pub mod quota;
pub mod ratelimit;
pub mod registry;

pub use config::{
    Channel, ChannelLoadBalance, ChannelStatus, CompositeMapping, ContentFilter, KeyLoadBalance,
    ModelMapping, ModelTable, QuotaType, ServiceType,
};
pub use credential::{
    AcquireError, ApiKeyCredential, Credential, CredentialId, CredentialPool, CredentialState,
    OAuthTokens, UnavailableReason,
};
pub use errors::{ProviderError, ProviderResult};
pub use failover::{
    ChannelHealth, FailoverAction, FailoverDecision, FailoverReason, circuit_open_decision,
    classify_failure,
};
pub use identity::{DEFAULT_REFRESH_SKEW_SECS, IdentityProvider, needs_refresh};
pub use pricing::{FlatRatePricing, PricingLookup};
pub use quota::{QuotaManager, QuotaStatus};
pub use ratelimit::{RateLimitOutcome, RateLimiter};
pub use events::{
    DownstreamEvent, Event, EventHub, EventSink, ModelUnavailableEndEvent,
    ModelUnavailableStartEvent, OperationalEvent, TerminalEventSink, UnavailableEndEvent,
    UnavailableStartEvent, UpstreamEvent,
};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use provider::{
    AuthRetryAction, HttpMethod, OAuthCallbackRequest, OAuthCallbackResult, OAuthCredential,
    OAuthStartRequest, UpstreamBody, UpstreamCtx, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamProvider,
};
pub use registry::ProviderRegistry;

// Re-export the protocol/transform typed enums from llmgate-transform.
pub use llmgate_transform::middleware::{
    GenerateContentRequest, GenerateContentResponse, Op, Proto, Request, Response, StreamEvent,
    StreamFormat, TransformContext, TransformError, stream_format,
};

// Re-export usage helpers used by the middleware/engine layer.
pub use llmgate_transform::middleware::{UsageAccumulator, UsageSummary, usage_from_response};

// Re-export the stream transform machinery used by the engine layer.
pub use llmgate_transform::middleware::{NostreamToStream, StreamToNostream, StreamTransformer};
