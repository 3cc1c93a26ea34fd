//! Socket API client: a pool of connections behind one subscribe surface
//!
//! The client owns every [`SocketConnection`] dialed for one API. A single
//! connect gate serializes connection establishment, so concurrent
//! subscribers coalesce onto the same socket up to the configured combine
//! target instead of racing to open duplicates. Once a connection is
//! chosen and live, independent subscribe handshakes interleave freely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sockmux_types::{ApiCredentials, SocketError, SocketResult};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{ConnectionSeed, ConnectionStatus, SocketConnection};
use crate::events::{EventReceiver, SocketEvent};
use crate::message::Interceptor;
use crate::options::SocketOptions;
use crate::protocol::SocketProtocol;
use crate::query::Query;
use crate::rate_limit::RateLimiter;
use crate::subscription::{StreamHandler, Subscription};
use crate::transport::{TransportFactory, WsFactory};

/// Handle to a live subscription
///
/// Dropping the handle leaves the subscription running; call
/// [`unsubscribe`](Self::unsubscribe) to release it.
pub struct SubscriptionHandle {
    subscription: Arc<Subscription>,
    inner: Arc<ClientInner>,
}

impl SubscriptionHandle {
    /// The client-unique subscription id
    pub fn id(&self) -> u64 {
        self.subscription.id()
    }

    pub fn is_confirmed(&self) -> bool {
        self.subscription.is_confirmed()
    }

    /// Messages delivered to the handler so far
    pub fn invocations(&self) -> u64 {
        self.subscription.invocations()
    }

    /// Release the subscription, sending its unsubscribe exchange
    pub async fn unsubscribe(self) -> bool {
        ClientInner::unsubscribe_by_id(&self.inner, self.subscription.id()).await
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id())
            .field("confirmed", &self.is_confirmed())
            .finish()
    }
}

/// Builder for [`SocketClient`]
pub struct SocketClientBuilder {
    options: SocketOptions,
    protocol: Arc<dyn SocketProtocol>,
    factory: Arc<dyn TransportFactory>,
    credentials: Option<ApiCredentials>,
    interceptor: Option<Interceptor>,
    limiter: RateLimiter,
    system_handlers: Vec<Arc<dyn StreamHandler>>,
}

impl SocketClientBuilder {
    fn new(options: SocketOptions, protocol: impl SocketProtocol) -> Self {
        Self {
            options,
            protocol: Arc::new(protocol),
            factory: Arc::new(WsFactory),
            credentials: None,
            interceptor: None,
            limiter: RateLimiter::new(),
            system_handlers: Vec::new(),
        }
    }

    /// Replace the transport factory (tests, exotic transports)
    pub fn with_transport_factory(mut self, factory: impl TransportFactory) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Shared factory variant of [`with_transport_factory`](Self::with_transport_factory)
    pub fn with_shared_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Credentials for authenticated connections
    pub fn with_credentials(mut self, credentials: ApiCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Byte-level transform applied to every inbound frame before parsing
    pub fn with_interceptor(
        mut self,
        interceptor: impl Fn(&[u8]) -> SocketResult<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }

    /// Outbound rate limiter
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Register a system stream installed on every connection at birth
    pub fn with_system_handler(mut self, handler: impl StreamHandler) -> Self {
        self.system_handlers.push(Arc::new(handler));
        self
    }

    pub fn build(self) -> SocketClient {
        let (events, event_rx) = mpsc::unbounded_channel();
        SocketClient {
            inner: Arc::new(ClientInner {
                options: Arc::new(self.options),
                protocol: self.protocol,
                factory: self.factory,
                credentials: self.credentials,
                interceptor: self.interceptor,
                limiter: Arc::new(self.limiter),
                connections: Arc::new(DashMap::new()),
                system_handlers: parking_lot::RwLock::new(self.system_handlers),
                connect_gate: tokio::sync::Mutex::new(()),
                disposing: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                events,
                event_rx: parking_lot::Mutex::new(Some(event_rx)),
            }),
        }
    }
}

/// Client for one streaming API: connection pool plus subscribe, query and
/// unsubscribe entry points
///
/// Cheap to clone; clones share the same pool and connect gate.
pub struct SocketClient {
    inner: Arc<ClientInner>,
}

impl Clone for SocketClient {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner {
    options: Arc<SocketOptions>,
    protocol: Arc<dyn SocketProtocol>,
    factory: Arc<dyn TransportFactory>,
    credentials: Option<ApiCredentials>,
    interceptor: Option<Interceptor>,
    limiter: Arc<RateLimiter>,
    connections: Arc<DashMap<u64, Arc<SocketConnection>>>,
    system_handlers: parking_lot::RwLock<Vec<Arc<dyn StreamHandler>>>,
    /// At most one connect in flight, client-wide
    connect_gate: tokio::sync::Mutex<()>,
    disposing: AtomicBool,
    /// Cancelled on dispose; periodic tasks and in-flight queries watch it
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<SocketEvent>,
    event_rx: parking_lot::Mutex<Option<EventReceiver>>,
}

impl SocketClient {
    /// Start building a client for `options` speaking `protocol`
    pub fn builder(options: SocketOptions, protocol: impl SocketProtocol) -> SocketClientBuilder {
        SocketClientBuilder::new(options, protocol)
    }

    /// The configuration this client runs with
    pub fn options(&self) -> &SocketOptions {
        &self.inner.options
    }

    /// Take the lifecycle event stream; only the first call yields it
    pub fn take_event_receiver(&self) -> Option<EventReceiver> {
        self.inner.event_rx.lock().take()
    }

    /// Register a system stream for connections created from now on
    pub fn register_system_handler(&self, handler: impl StreamHandler) {
        self.inner.system_handlers.write().push(Arc::new(handler));
    }

    /// Open a logical stream on the configured base address
    ///
    /// Picks or creates a connection, connects and authenticates it when
    /// needed, runs the handler's subscribe exchange, and attaches the
    /// subscription. `token` aborts the handshake; when it fires after the
    /// subscribe request reached the server, a best-effort unsubscribe is
    /// sent so nothing leaks server-side.
    pub async fn subscribe<H: StreamHandler>(
        &self,
        handler: H,
        token: CancellationToken,
    ) -> SocketResult<SubscriptionHandle> {
        self.subscribe_handler(Arc::new(handler), token).await
    }

    /// Trait-object variant of [`subscribe`](Self::subscribe)
    pub async fn subscribe_handler(
        &self,
        handler: Arc<dyn StreamHandler>,
        token: CancellationToken,
    ) -> SocketResult<SubscriptionHandle> {
        let inner = &self.inner;
        if inner.disposing.load(Ordering::Acquire) {
            return Err(SocketError::InvalidOperation("client is disposed".into()));
        }
        let subscription = Subscription::new(handler);
        if subscription.is_authenticated() && inner.credentials.is_none() {
            return Err(SocketError::NoCredentials);
        }

        let connection = self
            .checkout_connection(subscription.is_authenticated())
            .await?;

        if let Some(query) = subscription.subscribe_query(&connection) {
            if let Err(e) = connection.send_and_wait_query(query, &token).await {
                // a request the server may still ack needs a counter-order;
                // plain failures (lost transport, rejection) do not
                let send_unsub = matches!(e, SocketError::CancellationRequested);
                connection.close_subscription(&subscription, send_unsub).await;
                return Err(e);
            }
        }

        let hook_inner = Arc::clone(inner);
        let hook_token = token.clone();
        let released = subscription.hook_token();
        let subscription_id = subscription.id();
        tokio::spawn(async move {
            tokio::select! {
                _ = hook_token.cancelled() => {
                    let _ = ClientInner::unsubscribe_by_id(&hook_inner, subscription_id).await;
                }
                _ = released.cancelled() => {}
            }
        });

        connection.add_subscription(Arc::clone(&subscription));
        subscription.set_confirmed(true);
        info!(
            subscription_id,
            socket_id = connection.socket_id(),
            "subscription confirmed"
        );

        Ok(SubscriptionHandle {
            subscription,
            inner: Arc::clone(inner),
        })
    }

    /// Run a one-shot request/response exchange
    pub async fn query(
        &self,
        query: Query,
        token: CancellationToken,
    ) -> SocketResult<serde_json::Value> {
        let inner = &self.inner;
        if inner.disposing.load(Ordering::Acquire) {
            return Err(SocketError::InvalidOperation("client is disposed".into()));
        }
        if query.is_authenticated() && inner.credentials.is_none() {
            return Err(SocketError::NoCredentials);
        }

        let connection = self.checkout_connection(query.is_authenticated()).await?;
        connection.send_and_wait_query(query, &token).await
    }

    /// Select or create a connection and make sure it is live
    ///
    /// Serialized by the connect gate up to the point a connection is
    /// chosen; with a combine target of 1 the gate is released early since
    /// no coalescing can happen.
    async fn checkout_connection(&self, authenticated: bool) -> SocketResult<Arc<SocketConnection>> {
        let inner = &self.inner;
        if inner.disposing.load(Ordering::Acquire) {
            return Err(SocketError::InvalidOperation("client is disposed".into()));
        }

        let mut gate = Some(inner.connect_gate.lock().await);
        let connection = loop {
            if inner.disposing.load(Ordering::Acquire) {
                return Err(SocketError::InvalidOperation("client is disposed".into()));
            }
            let connection = inner
                .get_or_create_connection(&inner.options.base_address, authenticated)
                .await?;
            if !connection.can_accept() {
                continue;
            }
            if inner.options.subscription_combine_target == 1 {
                gate.take();
            }
            inner.connect_if_needed(&connection).await?;
            break connection;
        };
        drop(gate);

        if connection.is_paused() {
            return Err(SocketError::ServerError("socket paused".into()));
        }
        Ok(connection)
    }

    /// Run `build` against every connected socket each `interval`
    ///
    /// One callback per connection per tick; a failing exchange is
    /// reported through `on_result` and never stops the loop. The task
    /// exits when the client is disposed.
    pub fn query_periodic<B, R>(
        &self,
        label: impl Into<String>,
        interval: Duration,
        build: B,
        on_result: R,
    ) -> tokio::task::JoinHandle<()>
    where
        B: Fn(&SocketConnection) -> Option<Query> + Send + Sync + 'static,
        R: Fn(&SocketConnection, SocketResult<serde_json::Value>) + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let label = label.into();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if inner.disposing.load(Ordering::Acquire) {
                    break;
                }
                let connections: Vec<_> = inner
                    .connections
                    .iter()
                    .map(|entry| Arc::clone(entry.value()))
                    .collect();
                for connection in connections {
                    if connection.status() != ConnectionStatus::Connected {
                        continue;
                    }
                    let Some(query) = build(&connection) else {
                        continue;
                    };
                    debug!(task = %label, socket_id = connection.socket_id(), "periodic query");
                    let result = connection.send_and_wait_query(query, &inner.shutdown).await;
                    on_result(&connection, result);
                }
            }
            debug!(task = %label, "periodic query task exited");
        })
    }

    /// Release one subscription by id; false when it is not found
    pub async fn unsubscribe(&self, subscription_id: u64) -> bool {
        ClientInner::unsubscribe_by_id(&self.inner, subscription_id).await
    }

    /// Release every user subscription on every connection
    pub async fn unsubscribe_all(&self) {
        let connections: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for connection in connections {
            for subscription in connection.subscriptions_snapshot() {
                if !subscription.is_system() {
                    connection.close_subscription(&subscription, true).await;
                }
            }
        }
    }

    /// Force every connection through a reconnect cycle
    pub fn reconnect_all(&self) {
        for entry in self.inner.connections.iter() {
            entry.value().trigger_reconnect();
        }
    }

    /// Terminal shutdown: unsubscribe best effort, cancel pending queries,
    /// close every transport. Further calls fail with `InvalidOperation`.
    pub async fn dispose(&self) {
        if self.inner.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("disposing socket client");
        self.inner.shutdown.cancel();

        let connections: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for connection in connections {
            connection.dispose().await;
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposing.load(Ordering::Acquire)
    }

    /// Number of pooled connections
    pub fn current_connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Number of live user subscriptions across the pool
    pub fn current_subscriptions(&self) -> usize {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().user_subscription_count())
            .sum()
    }

    /// Aggregate inbound throughput in kilobytes per second
    pub fn incoming_kbps(&self) -> f64 {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().incoming_kbps())
            .sum()
    }

    /// Textual dump of every connection and its subscriptions
    pub fn state_dump(&self) -> String {
        let mut out = format!(
            "{} connections, {} user subscriptions\n",
            self.current_connections(),
            self.current_subscriptions(),
        );
        let mut connections: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        connections.sort_by_key(|c| c.socket_id());
        for connection in connections {
            out.push_str(&connection.describe());
        }
        out
    }
}

impl ClientInner {
    /// Pick the least-loaded eligible connection or create a fresh one
    ///
    /// Eligible means: same tag (trailing slash ignored), status None or
    /// Connected, and authenticated when the request needs it. The best
    /// candidate wins when it is under the combine target, or when the
    /// pool is capped and every candidate is already at or over it.
    async fn get_or_create_connection(
        self: &Arc<Self>,
        address: &str,
        authenticated: bool,
    ) -> SocketResult<Arc<SocketConnection>> {
        let tag = address.trim_end_matches('/');
        let mut eligible: Vec<Arc<SocketConnection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|c| c.tag().trim_end_matches('/') == tag)
            .filter(|c| c.can_accept())
            .filter(|c| !authenticated || c.requires_auth())
            .collect();
        eligible.sort_by_key(|c| c.user_subscription_count());

        if let Some(best) = eligible.first() {
            if best.under_target() {
                return Ok(Arc::clone(best));
            }
            if self.connections.len() >= self.options.max_socket_connections {
                debug!(
                    socket_id = best.socket_id(),
                    "pool saturated, overflowing least-loaded socket"
                );
                return Ok(Arc::clone(best));
            }
        }

        let url = self.protocol.connection_url(address).await?;
        let connection = SocketConnection::create(ConnectionSeed {
            tag: address.to_string(),
            uri: url,
            auth_required: authenticated,
            options: Arc::clone(&self.options),
            protocol: Arc::clone(&self.protocol),
            factory: Arc::clone(&self.factory),
            credentials: if authenticated {
                self.credentials.clone()
            } else {
                None
            },
            interceptor: self.interceptor.clone(),
            limiter: Arc::clone(&self.limiter),
            events: self.events.clone(),
            registry: Arc::downgrade(&self.connections),
        });
        for handler in self.system_handlers.read().iter() {
            connection.add_subscription(Subscription::system(Arc::clone(handler)));
        }
        debug!(
            socket_id = connection.socket_id(),
            url = %connection.uri(),
            "created socket connection"
        );
        Ok(connection)
    }

    /// Connect a fresh connection and register it with the pool
    async fn connect_if_needed(&self, connection: &Arc<SocketConnection>) -> SocketResult<()> {
        if connection.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        connection.connect().await?;
        self.connections
            .insert(connection.socket_id(), Arc::clone(connection));
        if !self.options.delay_after_connect.is_zero() {
            tokio::time::sleep(self.options.delay_after_connect).await;
        }
        Ok(())
    }

    async fn unsubscribe_by_id(inner: &Arc<ClientInner>, subscription_id: u64) -> bool {
        let found = inner.connections.iter().find_map(|entry| {
            let connection = Arc::clone(entry.value());
            connection
                .subscription(subscription_id)
                .map(|subscription| (connection, subscription))
        });
        match found {
            Some((connection, subscription)) if !subscription.is_system() => {
                connection.close_subscription(&subscription, true).await;
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("connections", &self.current_connections())
            .field("subscriptions", &self.current_subscriptions())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
