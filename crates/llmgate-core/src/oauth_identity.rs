//! Concrete `IdentityProvider` for §4.5: exchanges a channel's stored
//! refresh token for a new access token against `channel.oauth_token_url`,
//! using the same `UpstreamClient` the dispatch pipeline sends generate
//! calls through.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use llmgate_provider_core::{
    Channel, HttpMethod, IdentityProvider, OAuthTokens, ProviderError, UpstreamBody,
    UpstreamHttpRequest,
};

use crate::upstream_client::UpstreamClient;

#[derive(serde::Serialize)]
struct RefreshForm<'a> {
    grant_type: &'a str,
    refresh_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<&'a str>,
}

#[derive(serde::Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct HttpIdentityProvider {
    client: Arc<dyn UpstreamClient>,
}

impl HttpIdentityProvider {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn refresh(&self, channel: &Channel, tokens: &OAuthTokens) -> Result<OAuthTokens, ProviderError> {
        let token_url = channel
            .oauth_token_url
            .as_deref()
            .ok_or(ProviderError::MissingCredentialField("oauth_token_url"))?;
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .ok_or(ProviderError::MissingCredentialField("refresh_token"))?;

        let form = RefreshForm {
            grant_type: "refresh_token",
            refresh_token,
            client_id: channel.oauth_client_id.as_deref(),
            client_secret: channel.oauth_client_secret.as_deref(),
        };
        let body = serde_urlencoded::to_string(&form)
            .map_err(|err| ProviderError::Other(err.to_string()))?;

        let req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: token_url.to_string(),
            headers: vec![("content-type".into(), "application/x-www-form-urlencoded".into())],
            body: Some(Bytes::from(body)),
            is_stream: false,
            insecure_skip_verify: channel.insecure_skip_verify,
            response_header_timeout_secs: channel.response_header_timeout_secs,
        };

        let resp = self
            .client
            .send(req)
            .await
            .map_err(|failure| ProviderError::Other(format!("{failure:?}")))?;

        let body = match resp.body {
            UpstreamBody::Bytes(b) => b,
            UpstreamBody::Stream(_) => {
                return Err(ProviderError::Other("token endpoint returned a stream".into()));
            }
        };
        if !(200..300).contains(&resp.status) {
            return Err(ProviderError::Other(format!(
                "oauth refresh failed: http {}",
                resp.status
            )));
        }

        let parsed: RefreshResponse =
            serde_json::from_slice(&body).map_err(|err| ProviderError::Other(err.to_string()))?;
        let now = now_unix();
        Ok(OAuthTokens {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.or_else(|| tokens.refresh_token.clone()),
            id_token: parsed.id_token.or_else(|| tokens.id_token.clone()),
            last_refresh: Some(now),
            expires_at: now + parsed.expires_in.unwrap_or(3600),
        })
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
