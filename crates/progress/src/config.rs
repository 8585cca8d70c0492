//! Configuration for the live-update channel.

use std::sync::Arc;

use crate::reconnect::ReconnectPolicy;

/// Supplies a bearer token for the push-endpoint handshake.
///
/// The default deployment accepts unauthenticated connections (clients
/// subscribe by execution id only), so most configurations carry no
/// provider. Deployments that authenticate the transport inject one; the
/// channel fetches a fresh token before every connection attempt and
/// appends it to the handshake URL.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// Produce a token valid for the next handshake.
    async fn token(&self) -> Result<String, TokenError>;
}

/// Failure to obtain a handshake token.
///
/// Fails the connection attempt it was fetched for; the normal reconnect
/// policy applies afterwards.
#[derive(Debug, thiserror::Error)]
#[error("Token provider error: {0}")]
pub struct TokenError(pub String);

/// Configuration for one live-update channel.
#[derive(Clone)]
pub struct LiveConfig {
    /// Push endpoint URL, e.g. `wss://push.example.com/prod`.
    pub ws_url: String,
    /// Back-off applied after abnormal connection drops.
    pub reconnect: ReconnectPolicy,
    /// Optional handshake authentication.
    pub token_provider: Option<Arc<dyn TokenProvider>>,
}

impl LiveConfig {
    /// Configuration for an unauthenticated endpoint with the default
    /// reconnect policy.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            reconnect: ReconnectPolicy::default(),
            token_provider: None,
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var  | Default                  |
    /// |----------|--------------------------|
    /// | `WS_URL` | `ws://127.0.0.1:8787/ws` |
    pub fn from_env() -> Self {
        let ws_url = std::env::var("WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8787/ws".into());
        Self::new(ws_url)
    }

    /// Attach a token provider for authenticated deployments.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_default_reconnect_policy() {
        let config = LiveConfig::new("ws://localhost:9999");
        assert_eq!(config.ws_url, "ws://localhost:9999");
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(config.token_provider.is_none());
    }
}
