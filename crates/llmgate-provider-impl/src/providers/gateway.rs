use bytes::Bytes;

use llmgate_provider_core::{
    Channel, Credential, GenerateContentRequest, HttpMethod, ProviderError, ProviderResult,
    UpstreamCtx, UpstreamHttpRequest, UpstreamProvider,
};

use crate::auth_extractor;

const PROVIDER_NAME: &str = "gateway";

/// Builds the upstream HTTP request for any channel, regardless of
/// `serviceType`. Unlike the teacher's one-struct-per-vendor layout, routing
/// and auth-header shape are data (`Channel`/`Credential`), not code, so a
/// single implementation covers every wire family in scope.
#[derive(Debug, Default)]
pub struct GatewayProvider;

impl GatewayProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for GatewayProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn build_generate(
        &self,
        _ctx: &UpstreamCtx,
        channel: &Channel,
        credential: &Credential,
        req: &GenerateContentRequest,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let base_url = channel.base_url.trim_end_matches('/');

        match req {
            GenerateContentRequest::Claude(r) => {
                let url = format!("{base_url}/v1/messages");
                let is_stream = r.body.stream.unwrap_or(false);
                let body = serde_json::to_vec(&r.body)
                    .map_err(|err| ProviderError::Other(err.to_string()))?;
                let mut headers = Vec::new();
                apply_claude_auth(&mut headers, credential)?;
                auth_extractor::set_accept_json(&mut headers);
                auth_extractor::set_content_type_json(&mut headers);
                apply_anthropic_headers(&mut headers, &r.headers)?;
                Ok(UpstreamHttpRequest {
                    method: HttpMethod::Post,
                    url,
                    headers,
                    body: Some(Bytes::from(body)),
                    is_stream,
                    insecure_skip_verify: channel.insecure_skip_verify,
                    response_header_timeout_secs: channel.response_header_timeout_secs,
                })
            }
            GenerateContentRequest::OpenAIChat(r) => {
                let url = format!("{base_url}/v1/chat/completions");
                let is_stream = r.body.stream.unwrap_or(false);
                let body = serde_json::to_vec(&r.body)
                    .map_err(|err| ProviderError::Other(err.to_string()))?;
                let mut headers = Vec::new();
                apply_bearer_auth(&mut headers, credential)?;
                auth_extractor::set_accept_json(&mut headers);
                auth_extractor::set_content_type_json(&mut headers);
                Ok(UpstreamHttpRequest {
                    method: HttpMethod::Post,
                    url,
                    headers,
                    body: Some(Bytes::from(body)),
                    is_stream,
                    insecure_skip_verify: channel.insecure_skip_verify,
                    response_header_timeout_secs: channel.response_header_timeout_secs,
                })
            }
            GenerateContentRequest::OpenAIResponse(r) => {
                let url = format!("{base_url}/v1/responses");
                let is_stream = r.body.stream.unwrap_or(false);
                let body = serde_json::to_vec(&r.body)
                    .map_err(|err| ProviderError::Other(err.to_string()))?;
                let mut headers = Vec::new();
                apply_bearer_auth(&mut headers, credential)?;
                auth_extractor::set_accept_json(&mut headers);
                auth_extractor::set_content_type_json(&mut headers);
                Ok(UpstreamHttpRequest {
                    method: HttpMethod::Post,
                    url,
                    headers,
                    body: Some(Bytes::from(body)),
                    is_stream,
                    insecure_skip_verify: channel.insecure_skip_verify,
                    response_header_timeout_secs: channel.response_header_timeout_secs,
                })
            }
            GenerateContentRequest::Gemini(r) => {
                let url = format!(
                    "{base_url}/v1beta/{}:generateContent",
                    r.path.model
                );
                let body = serde_json::to_vec(&r.body)
                    .map_err(|err| ProviderError::Other(err.to_string()))?;
                let mut headers = Vec::new();
                let url = apply_gemini_auth(&mut headers, credential, url)?;
                auth_extractor::set_accept_json(&mut headers);
                auth_extractor::set_content_type_json(&mut headers);
                Ok(UpstreamHttpRequest {
                    method: HttpMethod::Post,
                    url,
                    headers,
                    body: Some(Bytes::from(body)),
                    is_stream: false,
                    insecure_skip_verify: channel.insecure_skip_verify,
                    response_header_timeout_secs: channel.response_header_timeout_secs,
                })
            }
            GenerateContentRequest::GeminiStream(r) => {
                let url = format!(
                    "{base_url}/v1beta/{}:streamGenerateContent",
                    r.path.model
                );
                let body = serde_json::to_vec(&r.body)
                    .map_err(|err| ProviderError::Other(err.to_string()))?;
                let mut headers = Vec::new();
                let mut url = apply_gemini_auth(&mut headers, credential, url)?;
                url.push_str(if url.contains('?') { "&alt=sse" } else { "?alt=sse" });
                auth_extractor::set_accept_json(&mut headers);
                auth_extractor::set_content_type_json(&mut headers);
                Ok(UpstreamHttpRequest {
                    method: HttpMethod::Post,
                    url,
                    headers,
                    body: Some(Bytes::from(body)),
                    is_stream: true,
                    insecure_skip_verify: channel.insecure_skip_verify,
                    response_header_timeout_secs: channel.response_header_timeout_secs,
                })
            }
        }
    }
}

fn apply_claude_auth(
    headers: &mut llmgate_provider_core::Headers,
    credential: &Credential,
) -> ProviderResult<()> {
    match credential {
        Credential::ApiKey(key) => {
            auth_extractor::set_header(headers, "x-api-key", key.api_key.as_str());
            Ok(())
        }
        Credential::OAuth(tokens) => {
            auth_extractor::set_bearer(headers, tokens.access_token.as_str());
            Ok(())
        }
    }
}

fn apply_bearer_auth(
    headers: &mut llmgate_provider_core::Headers,
    credential: &Credential,
) -> ProviderResult<()> {
    let token = match credential {
        Credential::ApiKey(key) => key.api_key.as_str(),
        Credential::OAuth(tokens) => tokens.access_token.as_str(),
    };
    auth_extractor::set_bearer(headers, token);
    Ok(())
}

/// Gemini accepts the key either as a query parameter (API key) or as a
/// bearer token (OAuth); returns the final URL with the key appended when
/// using the query-param form.
fn apply_gemini_auth(
    headers: &mut llmgate_provider_core::Headers,
    credential: &Credential,
    url: String,
) -> ProviderResult<String> {
    match credential {
        Credential::ApiKey(key) => {
            let sep = if url.contains('?') { '&' } else { '?' };
            Ok(format!("{url}{sep}key={}", key.api_key))
        }
        Credential::OAuth(tokens) => {
            auth_extractor::set_bearer(headers, tokens.access_token.as_str());
            Ok(url)
        }
    }
}

fn apply_anthropic_headers(
    headers: &mut llmgate_provider_core::Headers,
    anthropic_headers: &llmgate_protocol::claude::types::AnthropicHeaders,
) -> ProviderResult<()> {
    let value = serde_json::to_value(anthropic_headers)
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    let map = value
        .as_object()
        .ok_or_else(|| ProviderError::Other("unexpected anthropic headers shape".to_string()))?;

    if let Some(version) = map
        .get("anthropic-version")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
    {
        auth_extractor::set_header(headers, "anthropic-version", version);
    }
    if let Some(beta) = map.get("anthropic-beta") {
        let joined = match beta {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) => {
                let parts: Vec<&str> = items.iter().filter_map(|v| v.as_str()).collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(","))
                }
            }
            _ => None,
        };
        if let Some(joined) = joined {
            auth_extractor::set_header(headers, "anthropic-beta", &joined);
        }
    }
    Ok(())
}
