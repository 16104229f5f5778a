use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use llmgate_provider_core::AcquireError;
use llmgate_provider_core::Event;
use llmgate_provider_core::provider::UpstreamFailure;
use llmgate_provider_core::{
    AuthRetryAction, Channel, Credential, FailoverAction, GenerateContentRequest,
    GenerateContentResponse, Headers, IdentityProvider, Op, Proto, ProviderError,
    ProviderRegistry, Request, Response, StreamEvent, TransformContext, TransformError,
    UpstreamBody, UpstreamCtx, UpstreamEvent, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamProvider, UsageAccumulator, UsageSummary, classify_failure, header_set, needs_refresh,
    usage_from_response,
};

use llmgate_transform::middleware::{StreamTransformer, stream_format};

use crate::oauth_identity::HttpIdentityProvider;
use crate::scheduler::SessionAffinityTable;
use crate::state::{AppState, ProviderRuntime};
use crate::upstream_client::UpstreamClient;

mod types;
mod wire;

pub use types::ProxyAuth;
pub use types::ProxyCall;

use wire::{StreamDecoder, content_type_for_stream, encode_openai_chat_done, encode_stream_event};

type ChannelContext = (Arc<dyn UpstreamProvider>, Arc<ProviderRuntime>, Channel);

/// Outcome of a single channel attempt. `Exhausted` carries the last
/// response seen on that channel so the caller can fail over to another
/// channel, or surface it as a last resort if none remain.
enum ChannelOutcome {
    Response(UpstreamHttpResponse),
    Exhausted(UpstreamHttpResponse),
}

struct UpstreamEventInput<'a> {
    trace_id: Option<String>,
    auth: ProxyAuth,
    channel: String,
    credential_id: Option<i64>,
    internal: bool,
    attempt_no: u32,
    operation: String,
    upstream_req: &'a UpstreamHttpRequest,
    response_status: Option<u16>,
    response_headers: Option<Headers>,
    response_body: Option<Vec<u8>>,
    usage: Option<UsageSummary>,
    error_kind: Option<String>,
    error_message: Option<String>,
    transport_kind: Option<llmgate_provider_core::provider::UpstreamTransportErrorKind>,
}

const MAX_UPSTREAM_LOG_BODY_BYTES: usize = 50 * 1024 * 1024;

macro_rules! emit_upstream_event {
    (
        $engine:expr,
        $trace_id:expr,
        $auth:expr,
        $channel:expr,
        $credential_id:expr,
        $internal:expr,
        $attempt_no:expr,
        $operation:expr,
        $upstream_req:expr,
        $response_status:expr,
        $usage:expr,
        $error_kind:expr,
        $error_message:expr,
        $transport_kind:expr $(,)?
    ) => {
        $engine.emit_upstream_event(UpstreamEventInput {
            trace_id: $trace_id,
            auth: $auth,
            channel: $channel,
            credential_id: $credential_id,
            internal: $internal,
            attempt_no: $attempt_no,
            operation: $operation.into(),
            upstream_req: $upstream_req,
            response_status: $response_status,
            response_headers: None,
            response_body: None,
            usage: $usage,
            error_kind: $error_kind,
            error_message: $error_message,
            transport_kind: $transport_kind,
        })
    };
}

#[derive(Clone)]
pub struct ProxyEngine {
    state: Arc<AppState>,
    registry: Arc<ProviderRegistry>,
    client: Arc<dyn UpstreamClient>,
    storage: Arc<dyn llmgate_storage::Storage>,
    identity: Arc<dyn IdentityProvider>,
    affinity: Arc<SessionAffinityTable>,
}

impl ProxyEngine {
    pub fn new(
        state: Arc<AppState>,
        registry: Arc<ProviderRegistry>,
        client: Arc<dyn UpstreamClient>,
        storage: Arc<dyn llmgate_storage::Storage>,
    ) -> Self {
        let identity = Arc::new(HttpIdentityProvider::new(client.clone()));
        Self {
            state,
            registry,
            client,
            storage,
            identity,
            affinity: Arc::new(SessionAffinityTable::new()),
        }
    }

    pub fn events(&self) -> llmgate_provider_core::EventHub {
        self.state.events.clone()
    }

    pub fn event_redact_sensitive(&self) -> bool {
        self.state.global.load().event_redact_sensitive
    }

    pub fn authenticate_user_key(&self, api_key: &str) -> Option<ProxyAuth> {
        let snapshot = self.state.snapshot.load();

        let key = snapshot
            .user_keys
            .iter()
            .find(|k| k.enabled && k.api_key == api_key)?;
        let user = snapshot
            .users
            .iter()
            .find(|u| u.id == key.user_id && u.enabled)?;

        Some(ProxyAuth {
            user_id: user.id,
            user_key_id: key.id,
            user_agent: None,
            allowed_channels: key.allowed_channels.clone(),
            allowed_models: key.allowed_models.clone(),
        })
    }

    pub async fn handle(&self, call: ProxyCall) -> UpstreamHttpResponse {
        match call {
            ProxyCall::Generate {
                trace_id,
                auth,
                user_proto,
                user_op,
                req,
                session_id,
            } => {
                self.handle_generate(trace_id, auth, user_proto, user_op, *req, session_id)
                    .await
            }
        }
    }

    pub fn enabled_channel_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .state
            .snapshot
            .load()
            .providers
            .iter()
            .filter(|row| row.enabled)
            .map(|row| row.name.clone())
            .collect();
        out.sort();
        out
    }

    async fn handle_generate(
        &self,
        trace_id: Option<String>,
        auth: ProxyAuth,
        user_proto: Proto,
        user_op: Op,
        req_user: Request,
        session_id: Option<String>,
    ) -> UpstreamHttpResponse {
        let model = extract_model_from_request(&req_user);

        if let Some(ref m) = model
            && !auth.allowed_models.is_empty()
            && !auth.allowed_models.iter().any(|allowed| m.contains(allowed.as_str()))
        {
            return json_error(403, "permission_denied");
        }

        let api_family = crate::scheduler::ApiFamily::from_proto(user_proto);
        let mut failed_channels: Vec<String> = Vec::new();
        let mut failover_chain: std::collections::VecDeque<String> = std::collections::VecDeque::new();
        let mut active_composite: Option<String> = None;
        let mut last_failure: Option<UpstreamHttpResponse> = None;

        loop {
            let channel_id = if let Some(id) = failover_chain.pop_front() {
                id
            } else {
                if let Some(composite_id) = active_composite.take() {
                    failed_channels.push(composite_id);
                }
                let providers = self.state.providers.load();
                let had_candidates = !providers.is_empty();
                let selection = crate::scheduler::select_channel(
                    &providers,
                    &crate::scheduler::SelectInput {
                        api_family,
                        model: model.as_deref(),
                        failed_channels: &failed_channels,
                        allowed_channels: &auth.allowed_channels,
                        session_id: session_id.as_deref(),
                    },
                    &self.affinity,
                );
                match selection {
                    Ok(sel) => {
                        failover_chain = sel.failover_chain.into();
                        active_composite = sel.composite_id;
                        sel.channel_id
                    }
                    Err(err) => {
                        tracing::warn!(
                            ?api_family,
                            ?err,
                            model = model.as_deref().unwrap_or(""),
                            tried = failed_channels.len(),
                            "no channel available for request"
                        );
                        return match err {
                            crate::scheduler::SelectError::NoAllowedChannels => {
                                json_error(403, "no_allowed_channels")
                            }
                            crate::scheduler::SelectError::NoMatchingComposite => {
                                json_error(400, "composite_no_mapping")
                            }
                            crate::scheduler::SelectError::NoChannelAvailable => last_failure
                                .unwrap_or_else(|| {
                                    if had_candidates {
                                        json_error(503, "all_channels_failed")
                                    } else {
                                        json_error(503, "config_missing")
                                    }
                                }),
                        };
                    }
                }
            };

            match self
                .try_channel(
                    trace_id.clone(),
                    auth.clone(),
                    channel_id.clone(),
                    user_proto,
                    user_op,
                    req_user.clone(),
                    model.clone(),
                )
                .await
            {
                ChannelOutcome::Response(resp) => return resp,
                ChannelOutcome::Exhausted(resp) => {
                    failed_channels.push(channel_id);
                    last_failure = Some(resp);
                }
            }
        }
    }

    /// Attempts a single channel end to end: credential acquisition, the
    /// provider's auth/upgrade hooks, the upstream call, and its own
    /// credential-level retries. `Exhausted` means every credential in this
    /// channel was tried without success; the caller may fail over to
    /// another channel using the carried response as a last resort.
    async fn try_channel(
        &self,
        trace_id: Option<String>,
        auth: ProxyAuth,
        channel_id: String,
        user_proto: Proto,
        user_op: Op,
        req_user: Request,
        model: Option<String>,
    ) -> ChannelOutcome {
        let (provider_impl, runtime, channel) = match self.load_channel(&channel_id) {
            Ok(v) => v,
            Err(resp) => return ChannelOutcome::Exhausted(resp),
        };

        let Some(channel_proto) = channel.service_type.wire_proto() else {
            return ChannelOutcome::Exhausted(json_error(400, "composite_channel_not_routable"));
        };

        let to_channel = TransformContext {
            src: user_proto,
            dst: channel_proto,
            src_op: user_op,
            dst_op: user_op,
        };

        let req_user = match model
            .as_deref()
            .and_then(|m| crate::scheduler::apply_model_mapping(&channel, m))
        {
            Some(rewritten) => set_request_model(req_user, &rewritten),
            None => req_user,
        };

        let req_native = match transform_request_maybe(&to_channel, req_user) {
            Ok(r) => r,
            Err(err) => {
                return ChannelOutcome::Exhausted(json_error_with(
                    400,
                    "transform_request_failed",
                    format!("{err:?}"),
                ));
            }
        };

        let Request::GenerateContent(req_inner) = &req_native;

        let mut attempt_no: u32 = 1;
        let mut auth_retry_used: Option<i64> = None;
        let mut channel_retry_used: Option<i64> = None;
        let mut same_key_attempts: u32 = 0;
        let mut pinned: Option<(i64, Credential)> = None;
        loop {
            let (cred_id, cred) = match pinned.take() {
                Some(pinned_cred) => pinned_cred,
                None => {
                    same_key_attempts = 0;
                    match model.as_deref() {
                        Some(model) => match runtime
                            .pool
                            .acquire_for_model_with_strategy(
                                &channel_id,
                                model,
                                channel.key_load_balance,
                            )
                            .await
                        {
                            Ok(v) => v,
                            Err(AcquireError::ProviderUnknown) => {
                                return ChannelOutcome::Exhausted(json_error(
                                    404,
                                    "channel_not_found",
                                ));
                            }
                            Err(AcquireError::NoActiveCredentials) => {
                                return ChannelOutcome::Exhausted(json_error(
                                    503,
                                    "all_keys_failed",
                                ));
                            }
                        },
                        None => match runtime
                            .pool
                            .acquire_with_strategy(&channel_id, channel.key_load_balance)
                            .await
                        {
                            Ok(v) => v,
                            Err(AcquireError::ProviderUnknown) => {
                                return ChannelOutcome::Exhausted(json_error(
                                    404,
                                    "channel_not_found",
                                ));
                            }
                            Err(AcquireError::NoActiveCredentials) => {
                                return ChannelOutcome::Exhausted(json_error(
                                    503,
                                    "all_keys_failed",
                                ));
                            }
                        },
                    }
                }
            };

            let ctx = UpstreamCtx {
                trace_id: trace_id.clone(),
                user_id: Some(auth.user_id),
                user_key_id: Some(auth.user_key_id),
                user_agent: auth.user_agent.clone(),
                outbound_proxy: self.state.global.load().proxy.clone(),
                provider: channel_id.clone(),
                credential_id: Some(cred_id),
                op: user_op,
                internal: false,
                attempt_no,
            };

            let mut cred = cred;
            match provider_impl
                .upgrade_credential(&ctx, &channel, &cred, req_inner)
                .await
            {
                Ok(Some(new_cred)) => {
                    if let Err(resp) = self
                        .persist_credential_update(cred_id, &new_cred, &runtime)
                        .await
                    {
                        return ChannelOutcome::Exhausted(resp);
                    }
                    cred = new_cred;
                }
                Ok(None) => {}
                Err(err) => {
                    return ChannelOutcome::Exhausted(error_response_from_provider_err(&err));
                }
            }

            if let Credential::OAuth(tokens) = &cred {
                match self
                    .ensure_fresh_oauth(&runtime, &channel, cred_id, tokens.clone())
                    .await
                {
                    Ok(Some(refreshed)) => cred = Credential::OAuth(refreshed),
                    Ok(None) => {}
                    Err(resp) => return ChannelOutcome::Exhausted(resp),
                }
            }

            let upstream_req = match provider_impl
                .build_generate(&ctx, &channel, &cred, req_inner)
                .await
            {
                Ok(r) => r,
                Err(err) => {
                    return ChannelOutcome::Exhausted(error_response_from_provider_err(&err));
                }
            };

            let resp = match self.client.send(upstream_req.clone()).await {
                Ok(r) => r,
                Err(failure) => {
                    emit_upstream_event!(
                        self,
                        trace_id.clone(),
                        auth.clone(),
                        channel_id.clone(),
                        Some(cred_id),
                        false,
                        attempt_no,
                        format!("{:?}", user_op),
                        &upstream_req,
                        None,
                        None,
                        Some("transport".to_string()),
                        Some(failure_message(&failure)),
                        transport_kind_from_failure(&failure),
                    )
                    .await;
                    if let Some(resp) = self
                        .retry_on_failure(
                            &ctx,
                            &channel,
                            &cred,
                            req_inner,
                            &failure,
                            provider_impl.as_ref(),
                            &runtime,
                            &channel_id,
                            model.as_ref(),
                            cred_id,
                            &mut channel_retry_used,
                            &mut auth_retry_used,
                            &mut attempt_no,
                            &mut same_key_attempts,
                            &mut pinned,
                        )
                        .await
                    {
                        return ChannelOutcome::Exhausted(resp);
                    }
                    continue;
                }
            };

            let status = resp.status;
            let is_success = (200..300).contains(&status);
            if !is_success {
                let failure = match resp_body_bytes(&resp.body) {
                    Some(body) => UpstreamFailure::Http {
                        status,
                        headers: resp.headers.clone(),
                        body,
                    },
                    None => UpstreamFailure::Http {
                        status,
                        headers: resp.headers.clone(),
                        body: Bytes::new(),
                    },
                };
                self.emit_upstream_event(UpstreamEventInput {
                    trace_id: trace_id.clone(),
                    auth: auth.clone(),
                    channel: channel_id.clone(),
                    credential_id: Some(cred_id),
                    internal: false,
                    attempt_no,
                    operation: format!("{user_op:?}"),
                    upstream_req: &upstream_req,
                    response_status: Some(status),
                    response_headers: Some(resp.headers.clone()),
                    response_body: resp_body_bytes(&resp.body).map(|body| body.to_vec()),
                    usage: None,
                    error_kind: Some("http".to_string()),
                    error_message: Some(format!("http_status_{status}")),
                    transport_kind: None,
                })
                .await;
                if let Some(resp) = self
                    .retry_on_failure(
                        &ctx,
                        &channel,
                        &cred,
                        req_inner,
                        &failure,
                        provider_impl.as_ref(),
                        &runtime,
                        &channel_id,
                        model.as_ref(),
                        cred_id,
                        &mut channel_retry_used,
                        &mut auth_retry_used,
                        &mut attempt_no,
                        &mut same_key_attempts,
                        &mut pinned,
                    )
                    .await
                {
                    return ChannelOutcome::Exhausted(resp);
                }
                continue;
            }

            // Success path.
            runtime.health.record_success();
            match provider_impl
                .on_upstream_success(&ctx, &channel, &cred, req_inner, &resp)
                .await
            {
                Ok(Some(new_cred)) => {
                    if let Err(resp) = self
                        .persist_credential_update(cred_id, &new_cred, &runtime)
                        .await
                    {
                        return ChannelOutcome::Response(resp);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    return ChannelOutcome::Response(error_response_from_provider_err(&err));
                }
            }
            let resp = self
                .handle_success(
                    trace_id.clone(),
                    auth,
                    channel_id.clone(),
                    provider_impl,
                    channel,
                    cred_id,
                    cred,
                    attempt_no,
                    user_proto,
                    user_op,
                    channel_proto,
                    req_native,
                    upstream_req,
                    resp,
                )
                .await;
            return ChannelOutcome::Response(resp);
        }
    }

    /// Runs the provider's auth/upstream-failure retry hooks, then the
    /// one-shot OAuth refresh-on-401 (§4.5), then falls through to
    /// `classify_failure` (§4.3) to decide whether to retry the same key,
    /// fail over to another key on this channel, suspend the channel, or
    /// give up. Returns `Some(resp)` when the caller must return that
    /// response immediately; `None` means the caller should loop again
    /// (`attempt_no` has already been bumped, and `pinned` tells the loop
    /// whether to reuse the same credential or acquire a fresh one).
    #[allow(clippy::too_many_arguments)]
    async fn retry_on_failure(
        &self,
        ctx: &UpstreamCtx,
        channel: &Channel,
        cred: &Credential,
        req_inner: &GenerateContentRequest,
        failure: &UpstreamFailure,
        provider_impl: &dyn UpstreamProvider,
        runtime: &Arc<ProviderRuntime>,
        channel_id: &str,
        model: Option<&String>,
        cred_id: i64,
        channel_retry_used: &mut Option<i64>,
        auth_retry_used: &mut Option<i64>,
        attempt_no: &mut u32,
        same_key_attempts: &mut u32,
        pinned: &mut Option<(i64, Credential)>,
    ) -> Option<UpstreamHttpResponse> {
        if *channel_retry_used != Some(cred_id)
            && let Ok(action) = provider_impl
                .on_upstream_failure(ctx, channel, cred, req_inner, failure)
                .await
        {
            match action {
                AuthRetryAction::RetrySame => {
                    *channel_retry_used = Some(cred_id);
                    *attempt_no += 1;
                    *pinned = Some((cred_id, cred.clone()));
                    return None;
                }
                AuthRetryAction::UpdateCredential(new_cred) => {
                    if let Err(resp) = self
                        .persist_credential_update(cred_id, new_cred.as_ref(), runtime)
                        .await
                    {
                        return Some(resp);
                    }
                    *channel_retry_used = Some(cred_id);
                    *attempt_no += 1;
                    *pinned = Some((cred_id, *new_cred));
                    return None;
                }
                AuthRetryAction::None => {}
            }
        }
        if is_auth_failure(failure) && *auth_retry_used != Some(cred_id) {
            if let Ok(action) = provider_impl
                .on_auth_failure(ctx, channel, cred, req_inner, failure)
                .await
            {
                match action {
                    AuthRetryAction::RetrySame => {
                        *auth_retry_used = Some(cred_id);
                        *attempt_no += 1;
                        *pinned = Some((cred_id, cred.clone()));
                        return None;
                    }
                    AuthRetryAction::UpdateCredential(new_cred) => {
                        if let Err(resp) = self
                            .persist_credential_update(cred_id, new_cred.as_ref(), runtime)
                            .await
                        {
                            return Some(resp);
                        }
                        *auth_retry_used = Some(cred_id);
                        *attempt_no += 1;
                        *pinned = Some((cred_id, *new_cred));
                        return None;
                    }
                    AuthRetryAction::None => {}
                }
            } else if let Credential::OAuth(tokens) = cred {
                // §4.5: exactly one refresh-and-retry before the key is
                // handed to the generic failure classifier.
                *auth_retry_used = Some(cred_id);
                match self.identity.refresh(channel, tokens).await {
                    Ok(refreshed) => {
                        let refreshed_cred = Credential::OAuth(refreshed);
                        if let Err(resp) = self
                            .persist_credential_update(cred_id, &refreshed_cred, runtime)
                            .await
                        {
                            return Some(resp);
                        }
                        *attempt_no += 1;
                        *pinned = Some((cred_id, refreshed_cred));
                        return None;
                    }
                    Err(err) => {
                        tracing::warn!(
                            channel = %channel.id,
                            error = %err,
                            "oauth refresh-on-401 failed"
                        );
                    }
                }
            }
        }

        let decision = classify_failure(channel, failure);
        runtime.health.record_failure(decision.reason);

        match decision.action {
            FailoverAction::RetrySameKey => {
                *same_key_attempts += 1;
                if *same_key_attempts > decision.max_attempts {
                    return Some(failure_to_http(failure.clone()));
                }
                if decision.wait > Duration::ZERO {
                    tokio::time::sleep(decision.wait).await;
                }
                *attempt_no += 1;
                *pinned = Some((cred_id, cred.clone()));
                None
            }
            FailoverAction::FailoverKey => {
                if decision.mark_key_failed {
                    runtime.pool.mark_failed(cred_id, decision.reason.into()).await;
                } else if decision.deprioritize_key {
                    runtime
                        .pool
                        .mark_unavailable(cred_id, decision.wait, decision.reason.into())
                        .await;
                }
                if decision.suspend_channel {
                    runtime.health.suspend();
                }
                if !self
                    .has_retry_candidate(runtime, channel_id, model, channel.key_load_balance)
                    .await
                {
                    return Some(failure_to_http(failure.clone()));
                }
                backoff_sleep(*attempt_no).await;
                *attempt_no += 1;
                None
            }
            FailoverAction::SuspendChannel => {
                runtime.health.suspend();
                Some(failure_to_http(failure.clone()))
            }
            FailoverAction::ReturnError => Some(failure_to_http(failure.clone())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_success(
        &self,
        trace_id: Option<String>,
        auth: ProxyAuth,
        channel_id: String,
        provider_impl: Arc<dyn UpstreamProvider>,
        channel: Channel,
        cred_id: i64,
        cred: Credential,
        attempt_no: u32,
        user_proto: Proto,
        user_op: Op,
        channel_proto: Proto,
        req_native: Request,
        upstream_req: UpstreamHttpRequest,
        upstream_resp: UpstreamHttpResponse,
    ) -> UpstreamHttpResponse {
        match user_op {
            Op::GenerateContent => {
                self.handle_nonstream_response(
                    trace_id,
                    auth,
                    channel_id,
                    provider_impl,
                    channel,
                    cred_id,
                    cred,
                    attempt_no,
                    user_proto,
                    channel_proto,
                    upstream_req,
                    upstream_resp,
                )
                .await
            }
            Op::StreamGenerateContent => {
                self.handle_stream_response(
                    trace_id,
                    auth,
                    channel_id,
                    channel_proto,
                    user_proto,
                    req_native,
                    cred_id,
                    attempt_no,
                    upstream_req,
                    upstream_resp,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_nonstream_response(
        &self,
        trace_id: Option<String>,
        auth: ProxyAuth,
        channel_id: String,
        provider_impl: Arc<dyn UpstreamProvider>,
        channel: Channel,
        cred_id: i64,
        cred: Credential,
        attempt_no: u32,
        user_proto: Proto,
        channel_proto: Proto,
        upstream_req: UpstreamHttpRequest,
        upstream_resp: UpstreamHttpResponse,
    ) -> UpstreamHttpResponse {
        let Some(body) = resp_body_bytes(&upstream_resp.body) else {
            return json_error(502, "upstream_body_missing");
        };
        let ctx = UpstreamCtx {
            trace_id: trace_id.clone(),
            user_id: Some(auth.user_id),
            user_key_id: Some(auth.user_key_id),
            user_agent: auth.user_agent.clone(),
            outbound_proxy: self.state.global.load().proxy.clone(),
            provider: channel_id.clone(),
            credential_id: Some(cred_id),
            op: Op::GenerateContent,
            internal: false,
            attempt_no,
        };
        let body = match provider_impl.normalize_nonstream_response(
            &ctx,
            &channel,
            &cred,
            channel_proto,
            Op::GenerateContent,
            body,
        ) {
            Ok(body) => body,
            Err(err) => return error_response_from_provider_err(&err),
        };

        let resp_native = match decode_response(channel_proto, &body) {
            Ok(r) => r,
            Err(err) => return json_error_with(502, "decode_response_failed", err.to_string()),
        };

        let usage = resp_native_generate_usage(channel_proto, &resp_native);

        self.emit_upstream_event(UpstreamEventInput {
            trace_id: trace_id.clone(),
            auth,
            channel: channel_id.clone(),
            credential_id: Some(cred_id),
            internal: false,
            attempt_no,
            operation: format!("{:?}", Op::GenerateContent),
            upstream_req: &upstream_req,
            response_status: Some(upstream_resp.status),
            response_headers: Some(upstream_resp.headers.clone()),
            response_body: Some(body.to_vec()),
            usage: usage.clone(),
            error_kind: None,
            error_message: None,
            transport_kind: None,
        })
        .await;

        let to_user = TransformContext {
            src: channel_proto,
            dst: user_proto,
            src_op: Op::GenerateContent,
            dst_op: Op::GenerateContent,
        };
        let resp_user = match transform_response_maybe(&to_user, resp_native) {
            Ok(r) => r,
            Err(err) => {
                return json_error_with(500, "transform_response_failed", format!("{err:?}"));
            }
        };

        let out_bytes = match encode_response(&resp_user) {
            Ok(b) => b,
            Err(err) => return json_error_with(500, "encode_response_failed", err.to_string()),
        };

        let mut headers = upstream_resp.headers.clone();
        header_set(&mut headers, "content-type", "application/json");
        UpstreamHttpResponse {
            status: upstream_resp.status,
            headers,
            body: UpstreamBody::Bytes(out_bytes),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_stream_response(
        &self,
        trace_id: Option<String>,
        auth: ProxyAuth,
        channel_id: String,
        channel_proto: Proto,
        user_proto: Proto,
        req_native: Request,
        cred_id: i64,
        attempt_no: u32,
        upstream_req: UpstreamHttpRequest,
        upstream_resp: UpstreamHttpResponse,
    ) -> UpstreamHttpResponse {
        let UpstreamBody::Stream(rx_in) = upstream_resp.body else {
            return json_error(502, "expected_stream_body");
        };
        let format = stream_format(channel_proto);

        // Native Gemini stream passthrough.
        //
        // Protocol-level rule only:
        // - If downstream asks `alt=sse`, keep SSE framing.
        // - Otherwise prefer passthrough unless upstream is explicitly SSE, in which
        //   case we decode/encode to emit Gemini NDJSON for default downstream shape.
        let passthrough_native_gemini = user_proto == Proto::Gemini
            && channel_proto == Proto::Gemini
            && should_passthrough_native_gemini_stream(&req_native, &upstream_resp.headers);
        if passthrough_native_gemini {
            let (tx_out, rx_out) = tokio::sync::mpsc::channel::<Bytes>(32);
            let events = self.state.events.clone();
            let trace_id2 = trace_id.clone();
            let auth2 = auth;
            let channel2 = channel_id.clone();
            let upstream_req2 = upstream_req.clone();
            let (upstream_path, upstream_query) = split_path_query(&upstream_req.url);
            let upstream_resp_headers = upstream_resp.headers.clone();
            let redact_sensitive = self.state.global.load().event_redact_sensitive;
            let status = upstream_resp.status;

            tokio::spawn(async move {
                let mut rx_in = rx_in;
                let mut response_body = Vec::new();
                let mut error_kind: Option<String> = None;
                let mut error_message: Option<String> = None;
                while let Some(chunk) = rx_in.recv().await {
                    append_capped(
                        &mut response_body,
                        chunk.as_ref(),
                        MAX_UPSTREAM_LOG_BODY_BYTES,
                    );
                    if tx_out.send(chunk).await.is_err() {
                        error_kind = Some("stream_forward_error".to_string());
                        error_message = Some("downstream_stream_closed".to_string());
                        break;
                    }
                }
                events
                    .emit(Event::Upstream(UpstreamEvent {
                        trace_id: trace_id2,
                        at: SystemTime::now(),
                        user_id: Some(auth2.user_id),
                        user_key_id: Some(auth2.user_key_id),
                        provider: channel2,
                        credential_id: Some(cred_id),
                        internal: false,
                        attempt_no,
                        operation: format!("{:?}", Op::StreamGenerateContent),
                        request_method: upstream_req2.method.as_str().to_string(),
                        request_headers: maybe_redact_headers(
                            upstream_req2.headers.clone(),
                            redact_sensitive,
                        ),
                        request_path: upstream_path,
                        request_query: maybe_redact_query(upstream_query, redact_sensitive),
                        request_body: if redact_sensitive {
                            None
                        } else {
                            upstream_req2.body.clone().map(|b| b.to_vec())
                        },
                        response_status: Some(status),
                        response_headers: maybe_redact_headers(
                            upstream_resp_headers.clone(),
                            redact_sensitive,
                        ),
                        response_body: if redact_sensitive {
                            None
                        } else {
                            Some(response_body)
                        },
                        usage: None,
                        error_kind,
                        error_message,
                        transport_kind: None,
                    }))
                    .await;
            });

            return UpstreamHttpResponse {
                status: upstream_resp.status,
                headers: upstream_resp.headers,
                body: UpstreamBody::Stream(rx_out),
            };
        }

        let (tx_out, rx_out) = tokio::sync::mpsc::channel::<Bytes>(32);

        let events = self.state.events.clone();
        let trace_id2 = trace_id.clone();
        let auth2 = auth;
        let channel2 = channel_id.clone();
        let upstream_req2 = upstream_req.clone();
        let (upstream_path, upstream_query) = split_path_query(&upstream_req.url);
        let upstream_resp_headers = upstream_resp.headers.clone();
        let redact_sensitive = self.state.global.load().event_redact_sensitive;
        let status = upstream_resp.status;

        tokio::spawn(async move {
            let mut decoder = StreamDecoder::new(channel_proto, format);
            let mut usage_acc = UsageAccumulator::new(channel_proto);
            let mut response_body = Vec::new();
            let mut error_kind: Option<String> = None;
            let mut error_message: Option<String> = None;
            // For same-proto streams, prefer raw passthrough to avoid dropping
            // forward-compatible events during decode/re-encode.
            let passthrough_raw = channel_proto == user_proto && user_proto != Proto::Gemini;

            let mut transformer = if channel_proto == user_proto {
                None
            } else {
                let ctx = TransformContext {
                    src: channel_proto,
                    dst: user_proto,
                    src_op: Op::StreamGenerateContent,
                    dst_op: Op::StreamGenerateContent,
                };
                StreamTransformer::new(&ctx).ok()
            };

            let mut rx_in = rx_in;
            'stream_loop: while let Some(chunk) = rx_in.recv().await {
                append_capped(
                    &mut response_body,
                    chunk.as_ref(),
                    MAX_UPSTREAM_LOG_BODY_BYTES,
                );
                if passthrough_raw {
                    for ev in decoder.push_bytes(&chunk) {
                        let _ = usage_acc.push(&ev);
                    }
                    if tx_out.send(chunk).await.is_err() {
                        error_kind = Some("stream_forward_error".to_string());
                        error_message = Some("downstream_stream_closed".to_string());
                        break 'stream_loop;
                    }
                    continue;
                }

                for ev in decoder.push_bytes(&chunk) {
                    let _ = usage_acc.push(&ev);

                    let mut out_events: Vec<StreamEvent> = Vec::new();
                    if let Some(t) = transformer.as_mut() {
                        match t.push(ev) {
                            Ok(mut v) => out_events.append(&mut v),
                            Err(err) => {
                                error_kind = Some("stream_transform_error".to_string());
                                error_message = Some(format!("{err:?}"));
                                break 'stream_loop;
                            }
                        }
                    } else {
                        out_events.push(ev);
                    }

                    for out_ev in out_events {
                        if let Some(bytes) = encode_stream_event(user_proto, &out_ev)
                            && tx_out.send(bytes).await.is_err()
                        {
                            error_kind = Some("stream_forward_error".to_string());
                            error_message = Some("downstream_stream_closed".to_string());
                            break 'stream_loop;
                        }
                    }
                }
            }

            if error_kind.is_none() {
                for ev in decoder.finish() {
                    let _ = usage_acc.push(&ev);
                    if passthrough_raw {
                        continue;
                    }

                    let mut out_events: Vec<StreamEvent> = Vec::new();
                    if let Some(t) = transformer.as_mut() {
                        match t.push(ev) {
                            Ok(mut v) => out_events.append(&mut v),
                            Err(err) => {
                                error_kind = Some("stream_transform_error".to_string());
                                error_message = Some(format!("{err:?}"));
                                break;
                            }
                        }
                    } else {
                        out_events.push(ev);
                    }

                    for out_ev in out_events {
                        if let Some(bytes) = encode_stream_event(user_proto, &out_ev)
                            && tx_out.send(bytes).await.is_err()
                        {
                            error_kind = Some("stream_forward_error".to_string());
                            error_message = Some("downstream_stream_closed".to_string());
                            break;
                        }
                    }
                    if error_kind.is_some() {
                        break;
                    }
                }
            }

            if error_kind.is_none()
                && !passthrough_raw
                && user_proto == Proto::OpenAIChat
                && tx_out.send(encode_openai_chat_done()).await.is_err()
            {
                error_kind = Some("stream_forward_error".to_string());
                error_message = Some("downstream_stream_closed".to_string());
            }

            // Usage, if the stream itself reported any. No side-channel fallback call.
            let usage = usage_acc.finalize();

            events
                .emit(Event::Upstream(UpstreamEvent {
                    trace_id: trace_id2,
                    at: SystemTime::now(),
                    user_id: Some(auth2.user_id),
                    user_key_id: Some(auth2.user_key_id),
                    provider: channel2,
                    credential_id: Some(cred_id),
                    internal: false,
                    attempt_no,
                    operation: format!("{:?}", Op::StreamGenerateContent),
                    request_method: upstream_req2.method.as_str().to_string(),
                    request_headers: maybe_redact_headers(
                        upstream_req2.headers.clone(),
                        redact_sensitive,
                    ),
                    request_path: upstream_path,
                    request_query: maybe_redact_query(upstream_query, redact_sensitive),
                    request_body: if redact_sensitive {
                        None
                    } else {
                        upstream_req2.body.clone().map(|b| b.to_vec())
                    },
                    response_status: Some(status),
                    response_headers: maybe_redact_headers(
                        upstream_resp_headers.clone(),
                        redact_sensitive,
                    ),
                    response_body: if redact_sensitive {
                        None
                    } else {
                        Some(response_body)
                    },
                    usage,
                    error_kind,
                    error_message,
                    transport_kind: None,
                }))
                .await;
        });

        let mut headers = upstream_resp.headers;
        header_set(
            &mut headers,
            "content-type",
            content_type_for_stream(user_proto),
        );
        UpstreamHttpResponse {
            status: upstream_resp.status,
            headers,
            body: UpstreamBody::Stream(rx_out),
        }
    }

    /// §4.5: refreshes an OAuth credential ahead of expiry. A no-op when the
    /// token is still fresh; single-flights concurrent callers on the same
    /// channel through `runtime.oauth_refresh_lock`.
    async fn ensure_fresh_oauth(
        &self,
        runtime: &Arc<ProviderRuntime>,
        channel: &Channel,
        cred_id: i64,
        tokens: llmgate_provider_core::OAuthTokens,
    ) -> Result<Option<llmgate_provider_core::OAuthTokens>, UpstreamHttpResponse> {
        if !needs_refresh(&tokens, now_unix(), llmgate_provider_core::DEFAULT_REFRESH_SKEW_SECS) {
            return Ok(None);
        }
        let _guard = runtime.oauth_refresh_lock.lock().await;
        match self.identity.refresh(channel, &tokens).await {
            Ok(refreshed) => {
                self.persist_credential_update(cred_id, &Credential::OAuth(refreshed.clone()), runtime)
                    .await?;
                Ok(Some(refreshed))
            }
            Err(err) => {
                tracing::warn!(channel = %channel.id, error = %err, "oauth refresh failed");
                Ok(None)
            }
        }
    }

    async fn persist_credential_update(
        &self,
        credential_id: i64,
        credential: &Credential,
        runtime: &Arc<ProviderRuntime>,
    ) -> Result<(), UpstreamHttpResponse> {
        let secret_json = serde_json::to_value(credential)
            .map_err(|err| json_error_with(500, "credential_encode_failed", err.to_string()))?;

        let (name, settings_json) = {
            let snapshot = self.state.snapshot.load();
            let name = snapshot
                .credentials
                .iter()
                .find(|row| row.id == credential_id)
                .and_then(|row| row.name.clone());
            let settings_json = snapshot
                .credentials
                .iter()
                .find(|row| row.id == credential_id)
                .map(|row| row.settings_json.clone())
                .unwrap_or_else(|| serde_json::json!({}));
            (name, settings_json)
        };

        if let Err(err) = self
            .storage
            .update_credential(credential_id, name.as_deref(), &settings_json, &secret_json)
            .await
        {
            tracing::warn!(credential_id, error = %err, "failed to persist credential update");
            return Err(json_error_with(500, "storage_error", err.to_string()));
        }

        if let Err(err) = self
            .state
            .apply_credential_update(credential_id, name, settings_json, secret_json)
            .await
        {
            tracing::warn!(credential_id, error = %err, "failed to apply credential update to in-memory state");
            return Err(json_error_with(500, "apply_memory_failed", err.to_string()));
        }

        // Keep runtime pool consistent even if snapshot row is disabled/missing.
        runtime
            .pool
            .update_credential(credential_id, credential.clone())
            .await;

        Ok(())
    }

    fn load_channel(&self, channel_id: &str) -> Result<ChannelContext, UpstreamHttpResponse> {
        // Respect admin-configured enabled flag from the in-memory snapshot.
        let enabled = {
            let snap = self.state.snapshot.load();
            snap.providers
                .iter()
                .find(|p| p.name == channel_id)
                .map(|p| p.enabled)
                .unwrap_or(false)
        };
        if !enabled {
            return Err(json_error(404, "channel_disabled"));
        }

        let runtime = {
            let map = self.state.providers.load();
            map.get(channel_id).cloned()
        };
        let Some(runtime) = runtime else {
            return Err(json_error(404, "channel_not_found"));
        };

        let cfg_value = runtime.config_json.load().as_ref().clone();
        let channel: Channel = serde_json::from_value(cfg_value)
            .map_err(|err| json_error_with(500, "channel_config_invalid", err.to_string()))?;

        let Some(provider_impl) = self.registry.get(llmgate_provider_impl::BUILTIN_PROVIDER_NAME)
        else {
            return Err(json_error(500, "channel_provider_unregistered"));
        };

        Ok((provider_impl, runtime, channel))
    }

    async fn has_retry_candidate(
        &self,
        runtime: &Arc<ProviderRuntime>,
        channel_id: &str,
        model: Option<&String>,
        key_load_balance: llmgate_provider_core::KeyLoadBalance,
    ) -> bool {
        match model {
            Some(model) => runtime
                .pool
                .acquire_for_model_with_strategy(channel_id, model, key_load_balance)
                .await
                .is_ok(),
            None => runtime
                .pool
                .acquire_with_strategy(channel_id, key_load_balance)
                .await
                .is_ok(),
        }
    }

    async fn emit_upstream_event(&self, input: UpstreamEventInput<'_>) {
        let redact_sensitive = self.state.global.load().event_redact_sensitive;
        let (request_path, request_query) = split_path_query(&input.upstream_req.url);
        self.state
            .events
            .emit(Event::Upstream(UpstreamEvent {
                trace_id: input.trace_id,
                at: SystemTime::now(),
                user_id: Some(input.auth.user_id),
                user_key_id: Some(input.auth.user_key_id),
                provider: input.channel,
                credential_id: input.credential_id,
                internal: input.internal,
                attempt_no: input.attempt_no,
                operation: input.operation,
                request_method: input.upstream_req.method.as_str().to_string(),
                request_headers: maybe_redact_headers(
                    input.upstream_req.headers.clone(),
                    redact_sensitive,
                ),
                request_path,
                request_query: maybe_redact_query(request_query, redact_sensitive),
                request_body: if redact_sensitive {
                    None
                } else {
                    input.upstream_req.body.clone().map(|b| b.to_vec())
                },
                response_status: input.response_status,
                response_headers: maybe_redact_headers(
                    input.response_headers.unwrap_or_default(),
                    redact_sensitive,
                ),
                response_body: if redact_sensitive {
                    None
                } else {
                    input.response_body
                },
                usage: input.usage,
                error_kind: input.error_kind,
                error_message: input.error_message,
                transport_kind: input.transport_kind,
            }))
            .await;
    }
}

fn split_path_query(target: &str) -> (String, Option<String>) {
    if let Some(scheme_idx) = target.find("://") {
        let rest = &target[(scheme_idx + 3)..];
        if let Some(path_idx) = rest.find('/') {
            let path_and_query = &rest[path_idx..];
            if let Some(q_idx) = path_and_query.find('?') {
                return (
                    path_and_query[..q_idx].to_string(),
                    Some(path_and_query[(q_idx + 1)..].to_string()),
                );
            }
            return (path_and_query.to_string(), None);
        }
    }
    if let Some(q_idx) = target.find('?') {
        return (
            target[..q_idx].to_string(),
            Some(target[(q_idx + 1)..].to_string()),
        );
    }
    (target.to_string(), None)
}

fn maybe_redact_headers(mut headers: Headers, redact: bool) -> Headers {
    if !redact {
        return headers;
    }
    for (name, value) in headers.iter_mut() {
        let lower = name.to_ascii_lowercase();
        if lower == "authorization" || lower == "x-api-key" || lower.contains("api-key") {
            *value = "[redacted]".to_string();
        }
    }
    headers
}

fn maybe_redact_query(query: Option<String>, redact: bool) -> Option<String> {
    if !redact {
        return query;
    }
    query.map(|q| {
        q.split('&')
            .map(|pair| {
                let (key, _) = pair.split_once('=').unwrap_or((pair, ""));
                if key.eq_ignore_ascii_case("key") || key.eq_ignore_ascii_case("api_key") {
                    format!("{key}=[redacted]")
                } else {
                    pair.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    })
}

fn transform_request_maybe(
    ctx: &TransformContext,
    req: Request,
) -> Result<Request, TransformError> {
    if ctx.src == ctx.dst && ctx.src_op == ctx.dst_op {
        return Ok(req);
    }
    llmgate_transform::middleware::transform_request(ctx, req)
}

fn transform_response_maybe(
    ctx: &TransformContext,
    resp: Response,
) -> Result<Response, TransformError> {
    if ctx.src == ctx.dst && ctx.src_op == ctx.dst_op {
        return Ok(resp);
    }
    llmgate_transform::middleware::transform_response(ctx, resp)
}

fn decode_response(proto: Proto, body: &Bytes) -> Result<Response, serde_json::Error> {
    Ok(Response::GenerateContent(match proto {
        Proto::Claude => GenerateContentResponse::Claude(serde_json::from_slice(body)?),
        Proto::OpenAIChat => GenerateContentResponse::OpenAIChat(serde_json::from_slice(body)?),
        Proto::OpenAIResponse => {
            GenerateContentResponse::OpenAIResponse(serde_json::from_slice(body)?)
        }
        Proto::Gemini => GenerateContentResponse::Gemini(serde_json::from_slice(body)?),
    }))
}

fn encode_response(resp: &Response) -> Result<Bytes, serde_json::Error> {
    let bytes = match resp {
        Response::GenerateContent(r) => match r {
            GenerateContentResponse::Claude(v) => serde_json::to_vec(v)?,
            GenerateContentResponse::OpenAIChat(v) => serde_json::to_vec(v)?,
            GenerateContentResponse::OpenAIResponse(v) => serde_json::to_vec(v)?,
            GenerateContentResponse::Gemini(v) => serde_json::to_vec(v)?,
        },
    };
    Ok(Bytes::from(bytes))
}

fn resp_native_generate_usage(proto: Proto, resp: &Response) -> Option<UsageSummary> {
    match resp {
        Response::GenerateContent(r) => usage_from_response(proto, r),
    }
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    if buf.len() >= cap {
        return true;
    }
    let remaining = cap.saturating_sub(buf.len());
    let take = remaining.min(chunk.len());
    buf.extend_from_slice(&chunk[..take]);
    take < chunk.len()
}

fn resp_body_bytes(body: &UpstreamBody) -> Option<Bytes> {
    match body {
        UpstreamBody::Bytes(b) => Some(b.clone()),
        UpstreamBody::Stream(_) => None,
    }
}

fn should_passthrough_native_gemini_stream(
    req_native: &Request,
    upstream_headers: &Headers,
) -> bool {
    if downstream_requests_gemini_sse(req_native) {
        return true;
    }
    !upstream_stream_is_sse(upstream_headers)
}

fn downstream_requests_gemini_sse(req_native: &Request) -> bool {
    let query = match req_native {
        Request::GenerateContent(GenerateContentRequest::GeminiStream(req)) => req.query.as_deref(),
        _ => None,
    };
    let Some(query) = query else {
        return false;
    };
    query_alt_value_is_sse(query)
}

fn query_alt_value_is_sse(query: &str) -> bool {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .any(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            key.eq_ignore_ascii_case("alt") && value.eq_ignore_ascii_case("sse")
        })
}

fn upstream_stream_is_sse(headers: &Headers) -> bool {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

fn extract_model_from_request(req: &Request) -> Option<String> {
    match req {
        Request::GenerateContent(inner) => match inner {
            GenerateContentRequest::Claude(req) => Some(claude_model_to_string(&req.body.model)),
            GenerateContentRequest::OpenAIChat(req) => Some(req.body.model.clone()),
            GenerateContentRequest::OpenAIResponse(req) => Some(req.body.model.clone()),
            GenerateContentRequest::Gemini(req) => Some(req.path.model.clone()),
            GenerateContentRequest::GeminiStream(req) => Some(req.path.model.clone()),
        },
    }
}

fn claude_model_to_string(model: &llmgate_protocol::claude::create_message::types::Model) -> String {
    model.to_string()
}

/// Applies a composite `rewrite_model`/channel `model_mapping` result to the
/// client request before it is transformed into the channel's wire shape.
fn set_request_model(req: Request, model: &str) -> Request {
    let Request::GenerateContent(inner) = req;
    let inner = match inner {
        GenerateContentRequest::Claude(mut r) => {
            r.body.model =
                llmgate_protocol::claude::create_message::types::Model::Custom(model.to_string());
            GenerateContentRequest::Claude(r)
        }
        GenerateContentRequest::OpenAIChat(mut r) => {
            r.body.model = model.to_string();
            GenerateContentRequest::OpenAIChat(r)
        }
        GenerateContentRequest::OpenAIResponse(mut r) => {
            r.body.model = model.to_string();
            GenerateContentRequest::OpenAIResponse(r)
        }
        GenerateContentRequest::Gemini(mut r) => {
            r.path.model = model.to_string();
            GenerateContentRequest::Gemini(r)
        }
        GenerateContentRequest::GeminiStream(mut r) => {
            r.path.model = model.to_string();
            GenerateContentRequest::GeminiStream(r)
        }
    };
    Request::GenerateContent(inner)
}

fn json_error(status: u16, code: &str) -> UpstreamHttpResponse {
    json_error_with(status, code, serde_json::Value::Null)
}

fn json_error_with(
    status: u16,
    code: &str,
    detail: impl Into<serde_json::Value>,
) -> UpstreamHttpResponse {
    let mut headers: Headers = Vec::new();
    header_set(&mut headers, "content-type", "application/json");
    let body = serde_json::json!({
        "error": code,
        "detail": detail.into(),
    });
    let bytes = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
    UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Bytes(bytes),
    }
}

fn error_response_from_provider_err(err: &ProviderError) -> UpstreamHttpResponse {
    match err {
        ProviderError::Unsupported(_) => json_error(501, "provider_unsupported"),
        ProviderError::InvalidConfig(_) => {
            json_error_with(500, "provider_invalid_config", format!("{err:?}"))
        }
        _ => json_error_with(500, "provider_error", format!("{err:?}")),
    }
}

fn failure_to_http(failure: UpstreamFailure) -> UpstreamHttpResponse {
    match failure {
        UpstreamFailure::Transport { kind: _, message } => {
            json_error_with(502, "upstream_transport_error", message)
        }
        UpstreamFailure::Http {
            status,
            headers,
            body,
        } => normalize_upstream_http_failure(status, headers, body),
    }
}

fn normalize_upstream_http_failure(
    status: u16,
    headers: Headers,
    body: Bytes,
) -> UpstreamHttpResponse {
    // Preserve native upstream JSON errors as-is.
    if upstream_http_error_is_json(&headers, &body) {
        return UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        };
    }

    // Normalize non-JSON upstream error pages (for example Cloudflare HTML)
    // to a stable machine-readable payload for downstream clients.
    let detail = upstream_http_error_detail(&body);
    json_error_with(
        status,
        "upstream_http_error",
        serde_json::json!({
            "status": status,
            "detail": detail,
        }),
    )
}

fn upstream_http_error_is_json(headers: &Headers, body: &Bytes) -> bool {
    let content_type_is_json = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| {
            let value = value.to_ascii_lowercase();
            value.contains("application/json") || value.contains("+json")
        })
        .unwrap_or(false);

    if content_type_is_json {
        return true;
    }

    serde_json::from_slice::<serde_json::Value>(body).is_ok()
}

fn upstream_http_error_detail(body: &Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.is_empty() {
        return "upstream returned non-json error response".to_string();
    }
    const MAX_LEN: usize = 512;
    let mut out = compact.chars().take(MAX_LEN).collect::<String>();
    if compact.chars().count() > MAX_LEN {
        out.push_str("...");
    }
    out
}

fn failure_message(failure: &UpstreamFailure) -> String {
    match failure {
        UpstreamFailure::Transport { message, .. } => message.clone(),
        UpstreamFailure::Http { status, .. } => format!("http_status_{status}"),
    }
}

fn transport_kind_from_failure(
    failure: &UpstreamFailure,
) -> Option<llmgate_provider_core::provider::UpstreamTransportErrorKind> {
    match failure {
        UpstreamFailure::Transport { kind, .. } => Some(*kind),
        _ => None,
    }
}

fn is_auth_failure(failure: &UpstreamFailure) -> bool {
    matches!(
        failure,
        UpstreamFailure::Http { status, .. } if *status == 401 || *status == 403
    )
}

fn retry_backoff_delay(attempt_no: u32) -> Duration {
    let step = attempt_no.saturating_sub(1).min(6);
    let base_ms = 200u64;
    let backoff = base_ms.saturating_mul(1u64 << step);
    let jitter = rand::random::<u64>() % (base_ms + 1);
    Duration::from_millis((backoff + jitter).min(2_000))
}

async fn backoff_sleep(attempt_no: u32) {
    let delay = retry_backoff_delay(attempt_no);
    if delay.as_millis() > 0 {
        tokio::time::sleep(delay).await;
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
