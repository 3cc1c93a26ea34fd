//! Transport abstraction
//!
//! The engine never touches a WebSocket library directly. It drives a
//! [`Transport`] trait object produced by a [`TransportFactory`], which
//! keeps connection logic testable without a network and lets callers swap
//! in exotic transports (compressed streams, unix sockets, proxies the
//! bundled dialer does not know about).
//!
//! The bundled [`WsTransport`] speaks WebSocket via tokio-tungstenite. The
//! channel-driven [`MockTransport`] lives behind the `test-utils` feature.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Transport layer errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport never opened
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer closed the stream
    #[error("connection closed")]
    ConnectionClosed,

    /// A write failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A read failed
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The open handshake exceeded its window
    #[error("connection timeout after {0:?}")]
    Timeout(Duration),

    /// Operation on a transport that is not open
    #[error("not connected")]
    NotConnected,
}

/// Parameters handed to a [`TransportFactory`]
#[derive(Debug, Clone)]
pub struct TransportParams {
    /// URL to dial
    pub url: String,
    /// Window for the open handshake
    pub connect_timeout: Duration,
    /// Desired keep-alive cadence, for transports that ping natively
    pub keep_alive_interval: Option<Duration>,
    /// Proxy address, honored by factories that support one
    pub proxy: Option<String>,
}

/// A bidirectional, ordered message channel
///
/// One task owns each transport; no interior synchronization is assumed.
#[async_trait]
pub trait Transport: Send {
    /// Open the underlying stream
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Write one text message
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Write a transport-level keep-alive ping
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Read the next message as raw bytes
    ///
    /// Returns `None` on a graceful close.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Close the stream
    async fn close(&mut self) -> Result<(), TransportError>;

    /// True while the stream is open
    fn is_connected(&self) -> bool;

    /// The dialed endpoint
    fn endpoint(&self) -> &str;

    /// Stable identity of this transport instance
    fn id(&self) -> u64;
}

/// Produces transports for new and redialed connections
pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self, params: TransportParams) -> Box<dyn Transport>;
}

/// WebSocket transport over tokio-tungstenite
pub struct WsTransport {
    id: u64,
    params: TransportParams,
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WsTransport {
    pub fn new(params: TransportParams) -> Self {
        Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            params,
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        debug!(url = %self.params.url, "opening websocket");

        let (stream, _response) = timeout(self.params.connect_timeout, connect_async(&self.params.url))
            .await
            .map_err(|_| TransportError::Timeout(self.params.connect_timeout))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        self.stream = Some(stream);
        debug!(url = %self.params.url, "websocket open");
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream
            .send(Message::Text(message.to_string()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = stream.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    self.stream = None;
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => {
                    self.stream = None;
                    return Err(TransportError::ConnectionClosed);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .close(None)
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn endpoint(&self) -> &str {
        &self.params.url
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// Default factory producing [`WsTransport`] instances
///
/// The bundled dialer goes direct; `params.proxy` is left to custom
/// factories.
#[derive(Debug, Default)]
pub struct WsFactory;

impl TransportFactory for WsFactory {
    fn create(&self, params: TransportParams) -> Box<dyn Transport> {
        Box::new(WsTransport::new(params))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockFactory, MockHandle, MockTransport};

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;

    type MockFrame = Result<Option<Vec<u8>>, TransportError>;

    /// In-memory transport driven from a [`MockHandle`]
    ///
    /// `recv` waits on a channel the test feeds, so connection logic can be
    /// exercised frame by frame without a network.
    pub struct MockTransport {
        id: u64,
        url: String,
        connected: bool,
        fail_connect: bool,
        incoming: mpsc::UnboundedReceiver<MockFrame>,
        outbound: mpsc::UnboundedSender<String>,
        pings: Arc<AtomicUsize>,
    }

    /// Test-side controls for one [`MockTransport`]
    pub struct MockHandle {
        incoming: mpsc::UnboundedSender<MockFrame>,
        outbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
        pings: Arc<AtomicUsize>,
    }

    impl MockTransport {
        /// Create a transport plus the handle that feeds it
        pub fn channel(url: impl Into<String>) -> (Self, MockHandle) {
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let pings = Arc::new(AtomicUsize::new(0));

            let transport = Self {
                id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
                url: url.into(),
                connected: false,
                fail_connect: false,
                incoming: incoming_rx,
                outbound: outbound_tx,
                pings: Arc::clone(&pings),
            };
            let handle = MockHandle {
                incoming: incoming_tx,
                outbound: tokio::sync::Mutex::new(outbound_rx),
                pings,
            };
            (transport, handle)
        }

        /// Make `connect` fail
        pub fn refuse_connect(mut self) -> Self {
            self.fail_connect = true;
            self
        }
    }

    impl MockHandle {
        /// Deliver a frame to the client
        pub fn push_frame(&self, frame: impl Into<String>) {
            let _ = self.incoming.send(Ok(Some(frame.into().into_bytes())));
        }

        /// Deliver raw bytes to the client
        pub fn push_bytes(&self, bytes: Vec<u8>) {
            let _ = self.incoming.send(Ok(Some(bytes)));
        }

        /// Simulate a graceful server close
        pub fn push_close(&self) {
            let _ = self.incoming.send(Ok(None));
        }

        /// Simulate a transport failure
        pub fn push_error(&self, error: TransportError) {
            let _ = self.incoming.send(Err(error));
        }

        /// Await the next frame the client wrote
        pub async fn next_sent(&self) -> Option<String> {
            self.outbound.lock().await.recv().await
        }

        /// The next already-written frame, if any
        pub fn try_next_sent(&self) -> Option<String> {
            self.outbound.try_lock().ok()?.try_recv().ok()
        }

        /// Keep-alive pings written so far
        pub fn ping_count(&self) -> usize {
            self.pings.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            if self.fail_connect {
                return Err(TransportError::ConnectionFailed("mock refused".into()));
            }
            self.connected = true;
            Ok(())
        }

        async fn send(&mut self, message: &str) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            self.outbound
                .send(message.to_string())
                .map_err(|_| TransportError::SendFailed("mock receiver dropped".into()))
        }

        async fn send_ping(&mut self) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            self.pings.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            match self.incoming.recv().await {
                Some(frame) => frame,
                None => Err(TransportError::ConnectionClosed),
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn endpoint(&self) -> &str {
            &self.url
        }

        fn id(&self) -> u64 {
            self.id
        }
    }

    /// Factory handing out prepared mock transports in order
    ///
    /// Each `prepare` queues one transport and returns its handle; the
    /// first connection takes the first transport, a reconnect takes the
    /// next, and so on. Creating past the prepared set yields transports
    /// that refuse to connect.
    #[derive(Default)]
    pub struct MockFactory {
        prepared: Mutex<VecDeque<MockTransport>>,
        created: AtomicUsize,
    }

    impl MockFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue one transport; returns the test-side handle
        pub fn prepare(&self) -> MockHandle {
            let (transport, handle) = MockTransport::channel("wss://mock.test");
            self.prepared.lock().push_back(transport);
            handle
        }

        /// Queue one transport that refuses to connect
        pub fn prepare_refusing(&self) {
            let (transport, _handle) = MockTransport::channel("wss://mock.test");
            self.prepared.lock().push_back(transport.refuse_connect());
        }

        /// How many transports were handed out
        pub fn created_count(&self) -> usize {
            self.created.load(Ordering::Relaxed)
        }
    }

    impl TransportFactory for MockFactory {
        fn create(&self, params: TransportParams) -> Box<dyn Transport> {
            self.created.fetch_add(1, Ordering::Relaxed);
            match self.prepared.lock().pop_front() {
                Some(mut transport) => {
                    transport.url = params.url;
                    Box::new(transport)
                }
                None => {
                    let (transport, _handle) = MockTransport::channel(params.url);
                    Box::new(transport.refuse_connect())
                }
            }
        }
    }
}
