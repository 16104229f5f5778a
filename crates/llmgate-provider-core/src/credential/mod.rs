mod model_unavailable_queue;
mod pool;
mod state;
mod unavailable_queue;

pub use pool::{AcquireError, CredentialPool};
pub use state::{CredentialId, CredentialState, UnavailableReason};

use serde::{Deserialize, Serialize};

/// A single credential drawn from a channel: one of its ordered `apiKeys`,
/// or the channel's shared OAuth token set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Credential {
    ApiKey(ApiKeyCredential),
    OAuth(OAuthTokens),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyCredential {
    pub api_key: String,
}

/// `channel.oauthTokens`. Acquisition (device-flow / authorization-code) is
/// out of scope; only use and refresh are implemented here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<i64>,
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_tokens_round_trip() {
        let value = serde_json::json!({
            "OAuth": {
                "access_token": "at",
                "expires_at": 1234,
            }
        });
        let cred: Credential = serde_json::from_value(value).expect("credential should parse");
        match cred {
            Credential::OAuth(tokens) => {
                assert_eq!(tokens.access_token, "at");
                assert_eq!(tokens.refresh_token, None);
                assert_eq!(tokens.expires_at, 1234);
            }
            other => panic!("unexpected credential variant: {other:?}"),
        }
    }
}
