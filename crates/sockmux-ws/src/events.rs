//! Connection lifecycle events
//!
//! Every client exposes a single event stream carrying lifecycle
//! transitions plus the two message sinks: frames nobody could parse and
//! frames nobody claimed. Consuming the stream is optional; dropping the
//! receiver is harmless.

use std::time::Duration;

use tokio::sync::mpsc;

/// Receiver half of a client's event stream
pub type EventReceiver = mpsc::UnboundedReceiver<SocketEvent>;

/// Why a connection's transport went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Server closed the connection
    ServerClosed,
    /// Network-level failure
    NetworkError(String),
    /// Nothing received within the configured no-data window
    NoDataTimeout,
    /// A reconnect was requested by the caller
    Requested,
}

/// Events emitted by socket connections
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Transport opened and authenticated where required
    Connected {
        socket_id: u64,
        url: String,
    },
    /// Transport lost; the reconnect loop takes over when enabled
    Disconnected {
        socket_id: u64,
        reason: DisconnectReason,
    },
    /// About to wait out a backoff delay before redialing
    Reconnecting {
        socket_id: u64,
        attempt: u32,
        delay: Duration,
    },
    /// All subscriptions replayed successfully after a reconnect
    Resubscribed {
        socket_id: u64,
        count: usize,
    },
    /// A resubscribe pass failed; backoff re-arms
    ResubscribeFailed {
        socket_id: u64,
        error: String,
    },
    /// A frame the pipeline could not interpret
    UnparsedMessage {
        socket_id: u64,
        raw: Vec<u8>,
        error: String,
    },
    /// A parsed frame no query and no subscription claimed
    UnhandledMessage {
        socket_id: u64,
        value: serde_json::Value,
    },
    /// Connection fully torn down and removed from the pool
    Closed {
        socket_id: u64,
    },
}
