//! Client configuration

use std::time::Duration;

/// Configuration for a [`SocketClient`](crate::client::SocketClient)
///
/// Every knob has a workable default; construct with [`SocketOptions::new`]
/// and override what you need with the `with_*` setters.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Default endpoint to dial
    pub base_address: String,
    /// Pool cap: maximum number of physical connections
    pub max_socket_connections: usize,
    /// Target maximum user subscriptions per connection; `1` disables
    /// coalescing entirely
    pub subscription_combine_target: usize,
    /// Idle-read window after which a connection reconnects itself
    pub socket_no_data_timeout: Option<Duration>,
    /// Base delay for the reconnect backoff
    pub reconnect_interval: Duration,
    /// Whether lost transports are redialed at all
    pub auto_reconnect: bool,
    /// Cap on reconnect attempts per outage; `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    /// Pause inserted after a successful connect before the first send
    pub delay_after_connect: Duration,
    /// Transport-level ping cadence; `None` disables keep-alive pings
    pub keep_alive_interval: Option<Duration>,
    /// How long a transport open may take
    pub connect_timeout: Duration,
    /// Default window for request/response exchanges
    pub query_timeout: Duration,
    /// Transport proxy, passed through to the transport factory
    pub proxy: Option<String>,
    /// Attach the original frame bytes to every routed message
    pub output_original_data: bool,
    /// Suppress the warning for frames nobody claims
    pub expect_unhandled_messages: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            base_address: String::new(),
            max_socket_connections: 10,
            subscription_combine_target: 10,
            socket_no_data_timeout: None,
            reconnect_interval: Duration::from_secs(5),
            auto_reconnect: true,
            max_reconnect_attempts: None,
            delay_after_connect: Duration::ZERO,
            keep_alive_interval: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(10),
            proxy: None,
            output_original_data: false,
            expect_unhandled_messages: false,
        }
    }
}

impl SocketOptions {
    /// Create options for the given base address
    pub fn new(base_address: impl Into<String>) -> Self {
        Self {
            base_address: base_address.into(),
            ..Default::default()
        }
    }

    /// Set the pool cap
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_socket_connections = max;
        self
    }

    /// Set the per-connection subscription target
    pub fn with_combine_target(mut self, target: usize) -> Self {
        self.subscription_combine_target = target.max(1);
        self
    }

    /// Set the idle-read reconnect window
    pub fn with_no_data_timeout(mut self, window: Duration) -> Self {
        self.socket_no_data_timeout = Some(window);
        self
    }

    /// Set the base reconnect delay
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Disable the reconnect loop entirely
    pub fn without_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Cap reconnect attempts per outage
    pub fn with_max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    /// Insert a pause between connect and the first send
    pub fn with_delay_after_connect(mut self, delay: Duration) -> Self {
        self.delay_after_connect = delay;
        self
    }

    /// Set the keep-alive ping cadence
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Disable keep-alive pings
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive_interval = None;
        self
    }

    /// Set the transport open timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default request/response window
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Route transports through a proxy
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Keep the original frame bytes on every routed message
    pub fn with_original_data(mut self) -> Self {
        self.output_original_data = true;
        self
    }

    /// Mark unclaimed frames as expected (no warning)
    pub fn expecting_unhandled_messages(mut self) -> Self {
        self.expect_unhandled_messages = true;
        self
    }
}
