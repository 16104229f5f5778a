//! §4.5 OAuth token lifecycle. Token *acquisition* (device-flow /
//! authorization-code, the dance that first populates `oauth_tokens`) is out
//! of scope; this only covers *use* and *refresh* of an already-populated
//! token pair, against a pluggable trait so the concrete token endpoint is
//! swappable per deployment. This crate performs no network IO itself — a
//! higher layer implements `IdentityProvider` against its HTTP client.

use async_trait::async_trait;

use crate::config::Channel;
use crate::credential::OAuthTokens;
use crate::errors::ProviderError;

/// Default skew: refresh this many seconds before `expires_at` rather than
/// waiting for a 401.
pub const DEFAULT_REFRESH_SKEW_SECS: i64 = 60;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchanges `tokens.refresh_token` for a fresh access token. The
    /// returned `OAuthTokens` replaces the channel's stored pair wholesale.
    async fn refresh(&self, channel: &Channel, tokens: &OAuthTokens) -> Result<OAuthTokens, ProviderError>;
}

/// True once `tokens` is within `skew_secs` of `expires_at`, or already past it.
pub fn needs_refresh(tokens: &OAuthTokens, now_unix: i64, skew_secs: i64) -> bool {
    tokens.expires_at - now_unix < skew_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(expires_at: i64) -> OAuthTokens {
        OAuthTokens {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            id_token: None,
            last_refresh: None,
            expires_at,
        }
    }

    #[test]
    fn token_well_inside_skew_needs_no_refresh() {
        assert!(!needs_refresh(&tokens(1_000), 0, DEFAULT_REFRESH_SKEW_SECS));
    }

    #[test]
    fn token_within_skew_needs_refresh() {
        assert!(needs_refresh(&tokens(1_030), 1_000, DEFAULT_REFRESH_SKEW_SECS));
    }

    #[test]
    fn already_expired_token_needs_refresh() {
        assert!(needs_refresh(&tokens(900), 1_000, DEFAULT_REFRESH_SKEW_SECS));
    }
}
