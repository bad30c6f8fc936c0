//! Streaming authentication.

use crate::transport::AuthFetcher;
use flagsync_protocol::AccessToken;
use std::sync::Arc;

/// Outcome of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Streaming is enabled and the token is usable.
    Success(AccessToken),
    /// The server answered but streaming is disabled for this environment.
    Disabled,
    /// A transient failure; another attempt may succeed.
    RecoverableFailure,
    /// A failure that retrying will not fix.
    NonRecoverableFailure,
}

/// Obtains streaming tokens for one matching key.
pub struct SseAuthenticator {
    fetcher: Arc<dyn AuthFetcher>,
    user_key: String,
}

impl SseAuthenticator {
    /// Creates an authenticator for `user_key`.
    pub fn new(fetcher: Arc<dyn AuthFetcher>, user_key: impl Into<String>) -> Self {
        Self {
            fetcher,
            user_key: user_key.into(),
        }
    }

    /// Requests and decodes a token.
    pub async fn authenticate(&self) -> AuthResult {
        let response = match self.fetcher.fetch_auth(&self.user_key).await {
            Ok(response) => response,
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "streaming auth failed, will retry");
                return AuthResult::RecoverableFailure;
            }
            Err(e) => {
                tracing::error!(error = %e, "streaming auth failed");
                return AuthResult::NonRecoverableFailure;
            }
        };

        if !response.push_enabled {
            tracing::info!("streaming is disabled for this environment");
            return AuthResult::Disabled;
        }

        let Some(raw) = response.token else {
            tracing::error!("streaming auth response carries no token");
            return AuthResult::NonRecoverableFailure;
        };

        match AccessToken::parse(&raw) {
            Ok(token) => {
                tracing::debug!(
                    channels = token.channels().len(),
                    expiration = token.expiration(),
                    "streaming token obtained"
                );
                AuthResult::Success(token)
            }
            Err(e) => {
                tracing::error!(error = %e, "streaming token could not be decoded");
                AuthResult::NonRecoverableFailure
            }
        }
    }
}
