//! Multiplexing WebSocket client engine for streaming APIs
//!
//! This crate is the socket half of a streaming API client: it opens and
//! maintains a pool of WebSocket connections, multiplexes many logical
//! subscriptions and one-shot queries onto them, routes every inbound
//! frame to the right handler, and drives authentication, keep-alive,
//! reconnect and resubscribe without the caller noticing.
//!
//! The engine is wire-format agnostic. A [`SocketProtocol`] implementation
//! supplies identifier extraction, URL rewriting and the authentication
//! exchange; [`StreamHandler`] implementations supply the per-stream
//! subscribe/unsubscribe exchanges and message handling.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use sockmux_ws::{Query, SocketClient, SocketOptions, SocketProtocol, TypedStream};
//! use tokio_util::sync::CancellationToken;
//!
//! struct TopicProtocol;
//!
//! impl SocketProtocol for TopicProtocol {
//!     fn identify(&self, value: &serde_json::Value) -> Vec<String> {
//!         value["topic"].as_str().map(|t| vec![t.to_string()]).unwrap_or_default()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SocketClient::builder(
//!         SocketOptions::new("wss://stream.example.com/ws"),
//!         TopicProtocol,
//!     )
//!     .build();
//!
//!     let stream = TypedStream::<serde_json::Value>::new(["trades.BTC-USD"], |update| {
//!         println!("{update}");
//!     })
//!     .with_subscribe(|_conn| {
//!         Some(Query::new(
//!             json!({"op": "subscribe", "topic": "trades.BTC-USD", "id": 1}),
//!             |msg| msg.value["id"] == 1,
//!         ))
//!     });
//!
//!     let handle = client.subscribe(stream, CancellationToken::new()).await?;
//!     println!("subscribed: {}", handle.id());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod connection;
pub mod events;
pub mod message;
pub mod options;
pub mod protocol;
pub mod query;
pub mod rate_limit;
pub mod reconnect;
pub mod subscription;
pub mod transport;

// Re-export main types
pub use client::{SocketClient, SocketClientBuilder, SubscriptionHandle};
pub use connection::{ConnectionStatus, SocketConnection};
pub use events::{DisconnectReason, EventReceiver, SocketEvent};
pub use message::{InboundMessage, Interceptor, MessagePipeline};
pub use options::SocketOptions;
pub use protocol::SocketProtocol;
pub use query::{id_matched, Query};
pub use rate_limit::RateLimiter;
pub use reconnect::ReconnectPolicy;
pub use sockmux_types::{ApiCredentials, SocketError, SocketResult};
pub use subscription::{StreamHandler, Subscription, TypedStream};
pub use transport::{Transport, TransportError, TransportFactory, TransportParams, WsTransport};

#[cfg(any(test, feature = "test-utils"))]
pub use transport::{MockFactory, MockHandle, MockTransport};
