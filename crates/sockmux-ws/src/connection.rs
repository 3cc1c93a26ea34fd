//! Socket connection: one transport, many subscriptions
//!
//! A [`SocketConnection`] owns exactly one transport and multiplexes any
//! number of subscriptions plus in-flight queries onto it. All transport
//! I/O happens inside a single actor task, which gives two guarantees for
//! free: outbound writes are serialized, and inbound dispatch is strictly
//! sequential so every subscription observes its messages in transport
//! order.
//!
//! Callers talk to the actor through commands. Pending queries are kept in
//! insertion order and completed at most once each; when the transport is
//! lost they all fail with `ConnectionLost` and the reconnect loop takes
//! over, replaying the subscribe exchange of every surviving subscription
//! before the connection reports `Connected` again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sockmux_types::{ApiCredentials, SocketError, SocketResult};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{DisconnectReason, SocketEvent};
use crate::message::{InboundMessage, Interceptor, MessagePipeline};
use crate::options::SocketOptions;
use crate::protocol::SocketProtocol;
use crate::query::Query;
use crate::rate_limit::RateLimiter;
use crate::reconnect::ReconnectPolicy;
use crate::subscription::Subscription;
use crate::transport::{Transport, TransportFactory, TransportParams};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one socket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Created, never connected
    None,
    /// Transport open in progress
    Connecting,
    /// Live and dispatching
    Connected,
    /// Transport lost, redial loop running
    Reconnecting,
    /// Teardown requested
    Closing,
    /// Torn down
    Closed,
    /// Torn down terminally by dispose
    Disposed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::None => "none",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Disposed => "disposed",
        };
        f.write_str(label)
    }
}

/// Everything needed to stand up a connection
pub(crate) struct ConnectionSeed {
    pub tag: String,
    pub uri: String,
    pub auth_required: bool,
    pub options: Arc<SocketOptions>,
    pub protocol: Arc<dyn SocketProtocol>,
    pub factory: Arc<dyn TransportFactory>,
    pub credentials: Option<ApiCredentials>,
    pub interceptor: Option<Interceptor>,
    pub limiter: Arc<RateLimiter>,
    pub events: mpsc::UnboundedSender<SocketEvent>,
    pub registry: Weak<DashMap<u64, Arc<SocketConnection>>>,
}

/// A query registered with the actor, awaiting its reply
struct PendingQuery {
    query: Query,
    frame: String,
    tx: oneshot::Sender<SocketResult<serde_json::Value>>,
    /// Set when the request hits the wire
    started_at: Instant,
}

enum Command {
    Query(Box<PendingQuery>),
    FireAndForget { frame: String },
    Reconnect,
    Close {
        disposing: bool,
        done: oneshot::Sender<()>,
    },
}

/// One physical connection hosting many logical streams
pub struct SocketConnection {
    socket_id: u64,
    tag: String,
    uri: parking_lot::RwLock<String>,
    auth_required: bool,
    status: parking_lot::Mutex<ConnectionStatus>,
    authenticated: AtomicBool,
    paused: AtomicBool,
    subscriptions: DashMap<u64, Arc<Subscription>>,
    user_subscriptions: AtomicUsize,
    meter: ThroughputMeter,
    commands: parking_lot::Mutex<Option<mpsc::UnboundedSender<Command>>>,
    pipeline: MessagePipeline,
    options: Arc<SocketOptions>,
    protocol: Arc<dyn SocketProtocol>,
    factory: Arc<dyn TransportFactory>,
    credentials: Option<ApiCredentials>,
    limiter: Arc<RateLimiter>,
    events: mpsc::UnboundedSender<SocketEvent>,
    registry: Weak<DashMap<u64, Arc<SocketConnection>>>,
}

impl SocketConnection {
    pub(crate) fn create(seed: ConnectionSeed) -> Arc<Self> {
        let pipeline = MessagePipeline::new(
            Arc::clone(&seed.protocol),
            seed.interceptor.clone(),
            seed.options.output_original_data,
        );
        Arc::new(Self {
            socket_id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            tag: seed.tag,
            uri: parking_lot::RwLock::new(seed.uri),
            auth_required: seed.auth_required,
            status: parking_lot::Mutex::new(ConnectionStatus::None),
            authenticated: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            subscriptions: DashMap::new(),
            user_subscriptions: AtomicUsize::new(0),
            meter: ThroughputMeter::new(),
            commands: parking_lot::Mutex::new(None),
            pipeline,
            options: seed.options,
            protocol: seed.protocol,
            factory: seed.factory,
            credentials: seed.credentials,
            limiter: seed.limiter,
            events: seed.events,
            registry: seed.registry,
        })
    }

    /// Process-unique id of this connection
    pub fn socket_id(&self) -> u64 {
        self.socket_id
    }

    /// The logical base address this connection was created for
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The URL actually dialed; may differ from the tag after rewriting
    pub fn uri(&self) -> String {
        self.uri.read().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// True while a lost transport is being redialed; no new traffic is
    /// accepted until resubscribe completes
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn requires_auth(&self) -> bool {
        self.auth_required
    }

    /// Count of live non-system subscriptions
    pub fn user_subscription_count(&self) -> usize {
        self.user_subscriptions.load(Ordering::Acquire)
    }

    /// Count of all attached subscriptions, system ones included
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Inbound throughput over the recent window, in kilobytes per second
    pub fn incoming_kbps(&self) -> f64 {
        self.meter.kbps()
    }

    /// True while this connection may be handed to new subscribers
    pub fn can_accept(&self) -> bool {
        matches!(
            self.status(),
            ConnectionStatus::None | ConnectionStatus::Connected
        )
    }

    /// True while the user-subscription load is below the combine target
    pub fn under_target(&self) -> bool {
        self.user_subscription_count() < self.options.subscription_combine_target
    }

    /// Capacity report consulted before attaching a new subscription
    pub fn can_add_subscription(&self) -> bool {
        self.can_accept() && self.under_target()
    }

    /// Attach a subscription; system subscriptions do not count toward load
    pub(crate) fn add_subscription(&self, subscription: Arc<Subscription>) {
        if !subscription.is_system() {
            self.user_subscriptions.fetch_add(1, Ordering::AcqRel);
        }
        self.subscriptions.insert(subscription.id(), subscription);
    }

    /// Look up an attached subscription by id
    pub(crate) fn subscription(&self, id: u64) -> Option<Arc<Subscription>> {
        self.subscriptions.get(&id).map(|s| Arc::clone(s.value()))
    }

    /// All attached subscriptions in id order
    pub(crate) fn subscriptions_snapshot(&self) -> Vec<Arc<Subscription>> {
        let mut subs: Vec<_> = self
            .subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        subs.sort_by_key(|s| s.id());
        subs
    }

    /// Open the transport, authenticate when required, and start the
    /// dispatch actor
    pub(crate) async fn connect(self: &Arc<Self>) -> SocketResult<()> {
        {
            let mut status = self.status.lock();
            match *status {
                ConnectionStatus::None => *status = ConnectionStatus::Connecting,
                ConnectionStatus::Connected => return Ok(()),
                other => {
                    return Err(SocketError::InvalidOperation(format!(
                        "cannot connect a {other} socket"
                    )))
                }
            }
        }

        self.limiter.acquire(RateLimiter::CONNECTION).await;

        let url = self.uri();
        let mut transport = self.factory.create(self.transport_params(&url));
        if let Err(e) = transport.connect().await {
            self.set_status(ConnectionStatus::None);
            return Err(SocketError::cant_connect(url, e.to_string()));
        }

        if self.auth_required {
            if let Err(e) = self.authenticate(&mut transport).await {
                let _ = transport.close().await;
                self.set_status(ConnectionStatus::None);
                return Err(e);
            }
            self.authenticated.store(true, Ordering::Release);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.commands.lock() = Some(tx);
        self.set_status(ConnectionStatus::Connected);
        info!(socket_id = self.socket_id, url = %url, "socket connected");
        self.emit(SocketEvent::Connected {
            socket_id: self.socket_id,
            url,
        });

        let actor = ConnectionActor {
            conn: Arc::clone(self),
            transport,
            commands: rx,
            pending: VecDeque::new(),
        };
        tokio::spawn(actor.run());
        Ok(())
    }

    /// Run the authentication exchange on a freshly opened transport
    async fn authenticate(&self, transport: &mut Box<dyn Transport>) -> SocketResult<()> {
        let credentials = self.credentials.as_ref().ok_or(SocketError::NoCredentials)?;
        let Some(query) = self.protocol.auth_query(credentials)? else {
            return Ok(());
        };
        let window = query.timeout().unwrap_or(self.options.query_timeout);
        let mut no_pending = VecDeque::new();
        match handshake(self, transport, &query, window, &mut no_pending).await {
            Ok(_) => Ok(()),
            Err(SocketError::ConnectionLost) => Err(SocketError::ConnectionLost),
            Err(e) => Err(SocketError::auth_failed(e)),
        }
    }

    /// Register a query, transmit it, and wait for the matching reply
    ///
    /// Fails with `CancellationRequested` on timeout or when `token`
    /// fires, and with `ConnectionLost` when the transport goes away
    /// underneath the exchange.
    pub(crate) async fn send_and_wait_query(
        &self,
        query: Query,
        token: &CancellationToken,
    ) -> SocketResult<serde_json::Value> {
        if query.is_authenticated() && !self.is_authenticated() {
            return Err(SocketError::InvalidOperation(
                "authenticated query on an unauthenticated socket".into(),
            ));
        }
        match self.status() {
            ConnectionStatus::Connected => {}
            ConnectionStatus::Reconnecting => return Err(SocketError::ConnectionLost),
            other => {
                return Err(SocketError::InvalidOperation(format!(
                    "cannot query a {other} socket"
                )))
            }
        }

        self.limiter.acquire(RateLimiter::MESSAGES).await;

        let frame = query.frame()?;
        let window = query.timeout().unwrap_or(self.options.query_timeout);
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Query(Box::new(PendingQuery {
            query,
            frame,
            tx,
            started_at: Instant::now(),
        })))?;

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SocketError::CancellationRequested),
            outcome = tokio::time::timeout(window, rx) => match outcome {
                Err(_elapsed) => Err(SocketError::CancellationRequested),
                Ok(Err(_actor_gone)) => Err(SocketError::ConnectionLost),
                Ok(Ok(result)) => result,
            },
        }
    }

    /// Detach a subscription, optionally releasing it server-side.
    ///
    /// Tearing down the whole connection happens if and only if the
    /// removal brought the user-subscription count to zero.
    pub(crate) async fn close_subscription(&self, subscription: &Arc<Subscription>, send_unsub: bool) {
        let removed = self.subscriptions.remove(&subscription.id()).is_some();
        if removed && !subscription.is_system() {
            self.user_subscriptions.fetch_sub(1, Ordering::AcqRel);
        }
        subscription.mark_closed();

        if send_unsub && self.status() == ConnectionStatus::Connected {
            if let Some(query) = subscription.unsubscribe_query() {
                match query.frame() {
                    Ok(frame) => {
                        debug!(
                            socket_id = self.socket_id,
                            subscription_id = subscription.id(),
                            "sending unsubscribe"
                        );
                        let _ = self.send_command(Command::FireAndForget { frame });
                    }
                    Err(e) => warn!(error = %e, "unsubscribe request did not serialize"),
                }
            }
        }

        if removed && !subscription.is_system() && self.user_subscription_count() == 0 {
            info!(
                socket_id = self.socket_id,
                "last subscription removed, closing socket"
            );
            self.close().await;
        }
    }

    /// Tear down the connection and everything on it
    pub async fn close(&self) {
        {
            let mut status = self.status.lock();
            match *status {
                ConnectionStatus::Closing
                | ConnectionStatus::Closed
                | ConnectionStatus::Disposed => return,
                _ => *status = ConnectionStatus::Closing,
            }
        }
        self.shutdown_actor(false).await;
    }

    /// Terminal teardown: best-effort unsubscribe for every live stream,
    /// then close
    pub(crate) async fn dispose(&self) {
        let was_connected = {
            let mut status = self.status.lock();
            match *status {
                ConnectionStatus::Closed | ConnectionStatus::Disposed => return,
                ConnectionStatus::Connected => true,
                _ => {
                    *status = ConnectionStatus::Closing;
                    false
                }
            }
        };

        if was_connected {
            // queue the unsubs ahead of the close command
            for subscription in self.subscriptions_snapshot() {
                if let Some(query) = subscription.unsubscribe_query() {
                    if let Ok(frame) = query.frame() {
                        let _ = self.send_command(Command::FireAndForget { frame });
                    }
                }
            }
            *self.status.lock() = ConnectionStatus::Closing;
        }
        self.shutdown_actor(true).await;
    }

    async fn shutdown_actor(&self, disposing: bool) {
        let sender = self.commands.lock().clone();
        match sender {
            Some(sender) => {
                let (done_tx, done_rx) = oneshot::channel();
                if sender
                    .send(Command::Close {
                        disposing,
                        done: done_tx,
                    })
                    .is_ok()
                {
                    let _ = done_rx.await;
                } else {
                    self.finalize_without_actor(disposing);
                }
            }
            // never connected; nothing to stop
            None => self.finalize_without_actor(disposing),
        }
    }

    fn finalize_without_actor(&self, disposing: bool) {
        *self.commands.lock() = None;
        for subscription in self.subscriptions_snapshot() {
            subscription.mark_closed();
        }
        self.subscriptions.clear();
        self.user_subscriptions.store(0, Ordering::Release);
        self.set_status(if disposing {
            ConnectionStatus::Disposed
        } else {
            ConnectionStatus::Closed
        });
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.socket_id);
        }
        self.emit(SocketEvent::Closed {
            socket_id: self.socket_id,
        });
    }

    /// Force a transport drop; the subscription set is preserved and the
    /// reconnect loop will resubscribe
    pub fn trigger_reconnect(&self) {
        let _ = self.send_command(Command::Reconnect);
    }

    /// Multi-line description of this connection and its subscriptions
    pub fn describe(&self) -> String {
        let mut out = format!(
            "socket {} [{}] {} authenticated={} paused={} incoming_kbps={:.1}\n",
            self.socket_id,
            self.status(),
            self.uri(),
            self.is_authenticated(),
            self.is_paused(),
            self.incoming_kbps(),
        );
        for sub in self.subscriptions_snapshot() {
            let mut identifiers: Vec<_> = sub.identifiers().iter().cloned().collect();
            identifiers.sort();
            out.push_str(&format!(
                "  subscription {} confirmed={} invocations={} system={} identifiers={:?}\n",
                sub.id(),
                sub.is_confirmed(),
                sub.invocations(),
                sub.is_system(),
                identifiers,
            ));
        }
        out
    }

    fn send_command(&self, command: Command) -> SocketResult<()> {
        self.commands
            .lock()
            .as_ref()
            .ok_or(SocketError::ConnectionLost)?
            .send(command)
            .map_err(|_| SocketError::ConnectionLost)
    }

    fn transport_params(&self, url: &str) -> TransportParams {
        TransportParams {
            url: url.to_string(),
            connect_timeout: self.options.connect_timeout,
            keep_alive_interval: self.options.keep_alive_interval,
            proxy: self.options.proxy.clone(),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    fn set_uri(&self, url: &str) {
        *self.uri.write() = url.to_string();
    }

    fn note_bytes(&self, bytes: u64) {
        self.meter.note(bytes);
    }

    fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    /// Interpret one raw frame through the pipeline
    fn interpret(&self, bytes: &[u8]) -> SocketResult<InboundMessage> {
        self.pipeline.interpret(bytes)
    }

    /// Route one parsed frame: pending queries in insertion order first,
    /// then every subscription whose identifiers intersect the frame's.
    fn dispatch_inbound(&self, pending: &mut VecDeque<PendingQuery>, message: &InboundMessage) {
        let mut matched_query = false;
        if let Some(index) = pending.iter().position(|p| p.query.matches(message)) {
            let entry = pending.remove(index).expect("index from position");
            debug!(
                socket_id = self.socket_id,
                elapsed = ?entry.started_at.elapsed(),
                "query answered"
            );
            let _ = entry.tx.send(entry.query.accept(message));
            matched_query = true;
            if !self.protocol.continue_on_query_response() {
                return;
            }
        }

        let routed = self.route_to_subscriptions(message);

        if !matched_query && !routed {
            if !self.options.expect_unhandled_messages {
                warn!(
                    socket_id = self.socket_id,
                    identifiers = ?message.identifiers,
                    "frame claimed by no query and no subscription"
                );
            }
            self.emit(SocketEvent::UnhandledMessage {
                socket_id: self.socket_id,
                value: message.value.clone(),
            });
        }
    }

    fn route_to_subscriptions(&self, message: &InboundMessage) -> bool {
        let mut routed = false;
        for entry in self.subscriptions.iter() {
            let subscription = entry.value();
            if subscription.claims(&message.identifiers) {
                routed = true;
                subscription.dispatch(self, message);
            }
        }
        routed
    }

    fn emit_unparsed(&self, bytes: &[u8], error: &SocketError) {
        debug!(socket_id = self.socket_id, error = %error, "unparseable frame");
        self.emit(SocketEvent::UnparsedMessage {
            socket_id: self.socket_id,
            raw: bytes.to_vec(),
            error: error.to_string(),
        });
    }
}

impl std::fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConnection")
            .field("socket_id", &self.socket_id)
            .field("tag", &self.tag)
            .field("status", &self.status())
            .field("authenticated", &self.is_authenticated())
            .field("user_subscriptions", &self.user_subscription_count())
            .finish_non_exhaustive()
    }
}

/// Send `query` and read frames until its reply arrives
///
/// Used for in-band exchanges the actor performs itself (authentication,
/// resubscribe): frames that are not the awaited reply still flow through
/// normal dispatch so interim data is not dropped.
async fn handshake(
    conn: &SocketConnection,
    transport: &mut Box<dyn Transport>,
    query: &Query,
    window: Duration,
    pending: &mut VecDeque<PendingQuery>,
) -> SocketResult<serde_json::Value> {
    let frame = query.frame()?;
    transport
        .send(&frame)
        .await
        .map_err(|_| SocketError::ConnectionLost)?;

    let deadline = tokio::time::Instant::now() + window;
    loop {
        let bytes = match tokio::time::timeout_at(deadline, transport.recv()).await {
            Err(_elapsed) => return Err(SocketError::CancellationRequested),
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => return Err(SocketError::ConnectionLost),
            Ok(Err(_)) => return Err(SocketError::ConnectionLost),
        };

        conn.note_bytes(bytes.len() as u64);
        match conn.interpret(&bytes) {
            Err(e) => conn.emit_unparsed(&bytes, &e),
            Ok(message) => {
                if query.matches(&message) {
                    return query.accept(&message);
                }
                conn.dispatch_inbound(pending, &message);
            }
        }
    }
}

enum SessionEnd {
    Closed {
        disposing: bool,
        /// Signalled after teardown completes
        done: Option<oneshot::Sender<()>>,
    },
    Lost(DisconnectReason),
}

enum ReconnectOutcome {
    Restored,
    GaveUp,
    Closed {
        disposing: bool,
        done: Option<oneshot::Sender<()>>,
    },
}

/// The task owning a connection's transport
struct ConnectionActor {
    conn: Arc<SocketConnection>,
    transport: Box<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: VecDeque<PendingQuery>,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            match self.run_session().await {
                SessionEnd::Closed { disposing, done } => {
                    self.finalize(disposing);
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    return;
                }
                SessionEnd::Lost(reason) => {
                    warn!(
                        socket_id = self.conn.socket_id,
                        ?reason,
                        "transport lost"
                    );
                    self.fail_pending(|| SocketError::ConnectionLost);
                    self.conn.paused.store(true, Ordering::Release);
                    self.conn.authenticated.store(false, Ordering::Release);
                    for subscription in self.conn.subscriptions_snapshot() {
                        if !subscription.is_system() {
                            subscription.set_confirmed(false);
                        }
                    }
                    self.conn.emit(SocketEvent::Disconnected {
                        socket_id: self.conn.socket_id,
                        reason,
                    });

                    let policy = ReconnectPolicy::from_options(&self.conn.options);
                    if !policy.enabled {
                        self.finalize(false);
                        return;
                    }

                    self.conn.set_status(ConnectionStatus::Reconnecting);
                    match self.reconnect(&policy).await {
                        ReconnectOutcome::Restored => continue,
                        ReconnectOutcome::GaveUp => {
                            self.finalize(false);
                            return;
                        }
                        ReconnectOutcome::Closed { disposing, done } => {
                            self.finalize(disposing);
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Drive one connected transport until it closes or is lost
    async fn run_session(&mut self) -> SessionEnd {
        let idle_window = self.conn.options.socket_no_data_timeout;
        let mut last_data = tokio::time::Instant::now();
        let mut keep_alive = self
            .conn
            .options
            .keep_alive_interval
            .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));

        loop {
            let idle_deadline = idle_window.map(|window| last_data + window);

            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None => return SessionEnd::Closed { disposing: false, done: None },
                    Some(Command::Close { disposing, done }) => {
                        self.fail_pending(|| SocketError::CancellationRequested);
                        let _ = self.transport.close().await;
                        return SessionEnd::Closed { disposing, done: Some(done) };
                    }
                    Some(Command::Reconnect) => {
                        let _ = self.transport.close().await;
                        return SessionEnd::Lost(DisconnectReason::Requested);
                    }
                    Some(Command::Query(entry)) => {
                        match self.transport.send(&entry.frame).await {
                            Ok(()) => {
                                let mut entry = *entry;
                                entry.started_at = Instant::now();
                                self.pending.push_back(entry);
                            }
                            Err(e) => {
                                let _ = entry.tx.send(Err(SocketError::ConnectionLost));
                                return SessionEnd::Lost(DisconnectReason::NetworkError(e.to_string()));
                            }
                        }
                    }
                    Some(Command::FireAndForget { frame }) => {
                        if let Err(e) = self.transport.send(&frame).await {
                            debug!(error = %e, "fire-and-forget send failed");
                        }
                    }
                },
                inbound = self.transport.recv() => match inbound {
                    Ok(Some(bytes)) => {
                        last_data = tokio::time::Instant::now();
                        self.conn.note_bytes(bytes.len() as u64);
                        self.handle_frame(&bytes);
                        // drop entries whose waiters gave up
                        self.pending.retain(|p| !p.tx.is_closed());
                    }
                    Ok(None) => return SessionEnd::Lost(DisconnectReason::ServerClosed),
                    Err(e) => return SessionEnd::Lost(DisconnectReason::NetworkError(e.to_string())),
                },
                _ = async { keep_alive.as_mut().expect("guarded").tick().await }, if keep_alive.is_some() => {
                    if let Err(e) = self.transport.send_ping().await {
                        debug!(error = %e, "keep-alive ping failed");
                    }
                },
                _ = async { tokio::time::sleep_until(idle_deadline.expect("guarded")).await }, if idle_deadline.is_some() => {
                    warn!(socket_id = self.conn.socket_id, "no data within idle window, reconnecting");
                    let _ = self.transport.close().await;
                    return SessionEnd::Lost(DisconnectReason::NoDataTimeout);
                },
            }
        }
    }

    fn handle_frame(&mut self, bytes: &[u8]) {
        match self.conn.interpret(bytes) {
            Ok(message) => self.conn.dispatch_inbound(&mut self.pending, &message),
            Err(e) => self.conn.emit_unparsed(bytes, &e),
        }
    }

    fn fail_pending(&mut self, make: impl Fn() -> SocketError) {
        for entry in self.pending.drain(..) {
            let _ = entry.tx.send(Err(make()));
        }
    }

    /// Backoff, redial, authenticate, resubscribe; repeat until restored,
    /// exhausted, or closed
    ///
    /// Failed attempts consult the error taxonomy: a non-retryable failure
    /// from the URL hook ends the loop, and an error's suggested retry
    /// delay floors the next backoff wait.
    async fn reconnect(&mut self, policy: &ReconnectPolicy) -> ReconnectOutcome {
        let mut attempt = 0u32;
        let mut delay_floor = Duration::ZERO;
        loop {
            attempt += 1;
            if !policy.should_retry(attempt) {
                warn!(
                    socket_id = self.conn.socket_id,
                    attempts = attempt - 1,
                    "reconnect attempts exhausted"
                );
                return ReconnectOutcome::GaveUp;
            }

            let delay = policy
                .jittered_delay(attempt)
                .max(std::mem::take(&mut delay_floor));
            info!(
                socket_id = self.conn.socket_id,
                attempt, ?delay, "reconnecting"
            );
            self.conn.emit(SocketEvent::Reconnecting {
                socket_id: self.conn.socket_id,
                attempt,
                delay,
            });
            if let Some(outcome) = self.wait_backoff(delay).await {
                return outcome;
            }

            let url = match self.conn.protocol.connection_url(self.conn.tag()).await {
                Ok(url) => url,
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "connection url refresh failed");
                    delay_floor = e.retry_after().unwrap_or_default();
                    continue;
                }
                Err(e) => {
                    warn!(
                        socket_id = self.conn.socket_id,
                        error = %e,
                        "connection url refresh failed terminally"
                    );
                    return ReconnectOutcome::GaveUp;
                }
            };
            self.conn.set_uri(&url);

            let mut transport = self.conn.factory.create(self.conn.transport_params(&url));
            if let Err(e) = transport.connect().await {
                let err = SocketError::cant_connect(&url, e.to_string());
                warn!(socket_id = self.conn.socket_id, error = %err, "redial failed");
                delay_floor = err.retry_after().unwrap_or_default();
                continue;
            }

            if self.conn.auth_required {
                match self.conn.authenticate(&mut transport).await {
                    Ok(()) => self.conn.authenticated.store(true, Ordering::Release),
                    Err(e) => {
                        warn!(socket_id = self.conn.socket_id, error = %e, "reauthentication failed");
                        delay_floor = e.retry_after().unwrap_or_default();
                        let _ = transport.close().await;
                        continue;
                    }
                }
            }

            match self.resubscribe(&mut transport).await {
                Ok(count) => {
                    self.transport = transport;
                    self.conn.set_status(ConnectionStatus::Connected);
                    self.conn.paused.store(false, Ordering::Release);
                    info!(
                        socket_id = self.conn.socket_id,
                        restored = count,
                        "reconnected and resubscribed"
                    );
                    self.conn.emit(SocketEvent::Resubscribed {
                        socket_id: self.conn.socket_id,
                        count,
                    });
                    return ReconnectOutcome::Restored;
                }
                Err(e) => {
                    warn!(socket_id = self.conn.socket_id, error = %e, "resubscribe failed");
                    self.conn.emit(SocketEvent::ResubscribeFailed {
                        socket_id: self.conn.socket_id,
                        error: e.to_string(),
                    });
                    delay_floor = e.retry_after().unwrap_or_default();
                    let _ = transport.close().await;
                    continue;
                }
            }
        }
    }

    /// Sleep out a backoff delay while staying responsive to commands
    async fn wait_backoff(&mut self, delay: Duration) -> Option<ReconnectOutcome> {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None => return Some(ReconnectOutcome::Closed { disposing: false, done: None }),
                    Some(Command::Close { disposing, done }) => {
                        self.fail_pending(|| SocketError::CancellationRequested);
                        return Some(ReconnectOutcome::Closed { disposing, done: Some(done) });
                    }
                    Some(Command::Query(entry)) => {
                        let _ = entry.tx.send(Err(SocketError::ConnectionLost));
                    }
                    Some(Command::FireAndForget { .. }) | Some(Command::Reconnect) => {}
                },
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    /// Replay the subscribe exchange of every surviving subscription
    async fn resubscribe(&mut self, transport: &mut Box<dyn Transport>) -> SocketResult<usize> {
        let subscriptions = self.conn.subscriptions_snapshot();
        for subscription in &subscriptions {
            if !subscription.is_system() {
                subscription.set_confirmed(false);
            }
        }

        let mut restored = 0usize;
        for subscription in &subscriptions {
            if subscription.is_closed() {
                continue;
            }
            subscription.revitalize();
            let Some(query) = subscription.subscribe_query(&self.conn) else {
                continue;
            };
            let window = query.timeout().unwrap_or(self.conn.options.query_timeout);
            handshake(&self.conn, transport, &query, window, &mut self.pending).await?;
            subscription.set_confirmed(true);
            restored += 1;
        }
        Ok(restored)
    }

    fn finalize(&mut self, disposing: bool) {
        self.fail_pending(|| SocketError::CancellationRequested);
        self.conn.finalize_without_actor(disposing);
        debug!(socket_id = self.conn.socket_id, disposing, "socket finalized");
    }
}

/// Rolling-window estimate of inbound throughput
struct ThroughputMeter {
    samples: parking_lot::Mutex<VecDeque<(Instant, u64)>>,
}

const METER_WINDOW: Duration = Duration::from_secs(10);

impl ThroughputMeter {
    fn new() -> Self {
        Self {
            samples: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    fn note(&self, bytes: u64) {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        samples.push_back((now, bytes));
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > METER_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn kbps(&self) -> f64 {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > METER_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
        let Some((oldest, _)) = samples.front() else {
            return 0.0;
        };
        let total: u64 = samples.iter().map(|(_, b)| b).sum();
        let span = now.duration_since(*oldest).max(Duration::from_secs(1));
        total as f64 / span.as_secs_f64() / 1024.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::StreamHandler;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct TopicProtocol;

    #[async_trait::async_trait]
    impl SocketProtocol for TopicProtocol {
        fn identify(&self, value: &serde_json::Value) -> Vec<String> {
            value["topic"]
                .as_str()
                .map(|t| vec![t.to_string()])
                .unwrap_or_default()
        }
    }

    struct Recorder {
        topic: String,
        seen: Arc<StdMutex<Vec<serde_json::Value>>>,
    }

    impl StreamHandler for Recorder {
        fn identifiers(&self) -> Vec<String> {
            vec![self.topic.clone()]
        }
        fn subscribe_query(&self, _connection: &SocketConnection) -> Option<Query> {
            None
        }
        fn unsubscribe_query(&self) -> Option<Query> {
            None
        }
        fn handle(
            &self,
            _connection: &SocketConnection,
            message: &InboundMessage,
        ) -> SocketResult<()> {
            self.seen.lock().unwrap().push(message.value.clone());
            Ok(())
        }
    }

    fn seed(
        factory: Arc<dyn TransportFactory>,
        events: mpsc::UnboundedSender<SocketEvent>,
        options: SocketOptions,
    ) -> ConnectionSeed {
        ConnectionSeed {
            tag: "wss://mock.test".into(),
            uri: "wss://mock.test".into(),
            auth_required: false,
            options: Arc::new(options),
            protocol: Arc::new(TopicProtocol),
            factory,
            credentials: None,
            interceptor: None,
            limiter: Arc::new(RateLimiter::new()),
            events,
            registry: Weak::new(),
        }
    }

    #[test]
    fn capacity_reporting() {
        let (events, _rx) = mpsc::unbounded_channel();
        let options = SocketOptions::new("wss://mock.test").with_combine_target(2);
        let conn = SocketConnection::create(seed(
            Arc::new(crate::transport::MockFactory::new()),
            events,
            options,
        ));

        assert_eq!(conn.status(), ConnectionStatus::None);
        assert!(conn.can_add_subscription());

        let seen = Arc::new(StdMutex::new(Vec::new()));
        for topic in ["a", "b"] {
            conn.add_subscription(Subscription::new(Arc::new(Recorder {
                topic: topic.into(),
                seen: Arc::clone(&seen),
            })));
        }
        assert_eq!(conn.user_subscription_count(), 2);
        assert!(!conn.can_add_subscription());

        // system subscriptions do not count toward load
        conn.add_subscription(Subscription::system(Arc::new(Recorder {
            topic: "sys".into(),
            seen,
        })));
        assert_eq!(conn.user_subscription_count(), 2);
        assert_eq!(conn.subscription_count(), 3);
    }

    #[tokio::test]
    async fn connect_failure_reverts_status() {
        let factory = Arc::new(crate::transport::MockFactory::new());
        let (events, _rx) = mpsc::unbounded_channel();
        let conn =
            SocketConnection::create(seed(factory, events, SocketOptions::new("wss://mock.test")));

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, SocketError::CantConnect { .. }));
        assert_eq!(conn.status(), ConnectionStatus::None);
    }

    #[tokio::test]
    async fn frames_route_to_claiming_subscription() {
        let factory = Arc::new(crate::transport::MockFactory::new());
        let handle = factory.prepare();
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let conn = SocketConnection::create(seed(
            factory,
            events,
            SocketOptions::new("wss://mock.test").without_keep_alive(),
        ));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        conn.add_subscription(Subscription::new(Arc::new(Recorder {
            topic: "trades.BTC".into(),
            seen: Arc::clone(&seen),
        })));

        conn.connect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Connected);

        handle.push_frame(r#"{"topic":"trades.BTC","px":7}"#);
        handle.push_frame(r#"{"topic":"nobody.cares"}"#);

        // an unhandled event proves both frames were dispatched in order
        loop {
            match events_rx.recv().await.unwrap() {
                SocketEvent::UnhandledMessage { value, .. } => {
                    assert_eq!(value["topic"], json!("nobody.cares"));
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0]["px"], json!(7));

        conn.close().await;
        assert_eq!(conn.status(), ConnectionStatus::Closed);
    }

    #[test]
    fn meter_reports_zero_when_idle() {
        let meter = ThroughputMeter::new();
        assert_eq!(meter.kbps(), 0.0);
        meter.note(2048);
        assert!(meter.kbps() > 0.0);
    }

    #[test]
    fn status_labels() {
        assert_eq!(ConnectionStatus::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionStatus::None.to_string(), "none");
    }
}
