//! The protocol hook: everything the engine cannot know about a concrete API
//!
//! The multiplexing engine is wire-format agnostic. A [`SocketProtocol`]
//! implementation supplies the format-specific pieces: how routing
//! identifiers are extracted from a parsed frame, how a base address is
//! rewritten into the concrete dial URL, and how a connection authenticates.

use async_trait::async_trait;
use sockmux_types::{ApiCredentials, SocketResult};

use crate::query::Query;

/// Format-specific behavior plugged into the socket engine
#[async_trait]
pub trait SocketProtocol: Send + Sync + 'static {
    /// Extract the routing identifiers a parsed frame is addressed to.
    ///
    /// Must be deterministic and total: return the identifiers the frame
    /// claims, or an empty vector when it claims none.
    fn identify(&self, value: &serde_json::Value) -> Vec<String>;

    /// Rewrite a base address into the URL to actually dial.
    ///
    /// Called when a fresh connection is created and again before each
    /// reconnect attempt, so rotating gateways and short-lived listen keys
    /// can be refreshed here.
    async fn connection_url(&self, base_address: &str) -> SocketResult<String> {
        Ok(base_address.to_string())
    }

    /// Build the authentication exchange performed right after the
    /// transport opens. `None` means the connection needs no handshake
    /// beyond the transport-level one.
    fn auth_query(&self, _credentials: &ApiCredentials) -> SocketResult<Option<Query>> {
        Ok(None)
    }

    /// When false (the default), a frame that answers a pending query is
    /// consumed by that query and never offered to subscriptions.
    fn continue_on_query_response(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Defaults;

    impl SocketProtocol for Defaults {
        fn identify(&self, _value: &serde_json::Value) -> Vec<String> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn default_url_is_identity() {
        let url = Defaults.connection_url("wss://api.example.com/ws").await.unwrap();
        assert_eq!(url, "wss://api.example.com/ws");
    }

    #[test]
    fn default_auth_is_none() {
        let creds = ApiCredentials::new("k", "s");
        assert!(Defaults.auth_query(&creds).unwrap().is_none());
        assert!(!Defaults.continue_on_query_response());
    }
}
