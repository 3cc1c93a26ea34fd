//! Subscriptions: long-lived logical streams multiplexed onto a connection
//!
//! A [`StreamHandler`] supplies the behavior of one logical stream: which
//! identifiers it claims, the subscribe/unsubscribe exchanges for its
//! topic, and what to do with each routed message. The engine wraps a
//! handler in a [`Subscription`], which carries the lifecycle state: a
//! client-unique id, the confirmed flag, and the invocation counter.
//!
//! System subscriptions handle server-originated control traffic (pings,
//! welcomes). They have no subscribe or unsubscribe exchange and do not
//! count toward a connection's user-subscription load.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use sockmux_types::{SocketError, SocketResult};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::connection::SocketConnection;
use crate::message::InboundMessage;
use crate::query::Query;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Behavior of one logical stream
pub trait StreamHandler: Send + Sync + 'static {
    /// The routing identifiers this stream claims; fixed for its lifetime
    fn identifiers(&self) -> Vec<String>;

    /// Whether this stream may only live on an authenticated connection
    fn authenticated(&self) -> bool {
        false
    }

    /// The exchange that must succeed before the stream is live.
    /// `None` means the stream is active the moment it is attached.
    fn subscribe_query(&self, connection: &SocketConnection) -> Option<Query>;

    /// The exchange that releases the stream server-side
    fn unsubscribe_query(&self) -> Option<Query>;

    /// Refresh stored request state (nonces, signatures) just before the
    /// subscribe exchange is replayed on a fresh transport
    fn revitalize(&self) {}

    /// Handle one routed message. Errors are logged, never fatal.
    ///
    /// Called from the connection's dispatch loop; hand long work off to a
    /// task instead of blocking here.
    fn handle(&self, connection: &SocketConnection, message: &InboundMessage) -> SocketResult<()>;
}

/// Lifecycle state around one [`StreamHandler`]
pub struct Subscription {
    id: u64,
    system: bool,
    authenticated: bool,
    identifiers: HashSet<String>,
    confirmed: AtomicBool,
    closed: AtomicBool,
    invocations: AtomicU64,
    /// Cancelled when the subscription closes, releasing any hook task
    hook_token: CancellationToken,
    handler: Arc<dyn StreamHandler>,
}

impl Subscription {
    /// Wrap a user handler
    pub fn new(handler: Arc<dyn StreamHandler>) -> Arc<Self> {
        Self::build(handler, false)
    }

    /// Wrap a system handler: no subscribe/unsubscribe exchange, attached
    /// to every connection at birth
    pub fn system(handler: Arc<dyn StreamHandler>) -> Arc<Self> {
        Self::build(handler, true)
    }

    fn build(handler: Arc<dyn StreamHandler>, system: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            system,
            authenticated: handler.authenticated(),
            identifiers: handler.identifiers().into_iter().collect(),
            confirmed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            invocations: AtomicU64::new(0),
            hook_token: CancellationToken::new(),
            handler,
        })
    }

    /// Client-unique subscription id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// True once the subscribe exchange has been acknowledged on the
    /// current transport
    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    pub(crate) fn set_confirmed(&self, confirmed: bool) {
        self.confirmed.store(confirmed, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Messages delivered to the handler so far
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// The identifiers this subscription claims
    pub fn identifiers(&self) -> &HashSet<String> {
        &self.identifiers
    }

    /// Token cancelled when the subscription closes
    pub(crate) fn hook_token(&self) -> CancellationToken {
        self.hook_token.clone()
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.confirmed.store(false, Ordering::Release);
        self.hook_token.cancel();
    }

    /// True when any of `identifiers` belongs to this subscription
    pub(crate) fn claims(&self, identifiers: &[String]) -> bool {
        identifiers.iter().any(|id| self.identifiers.contains(id))
    }

    pub(crate) fn subscribe_query(&self, connection: &SocketConnection) -> Option<Query> {
        if self.system {
            None
        } else {
            self.handler.subscribe_query(connection)
        }
    }

    pub(crate) fn unsubscribe_query(&self) -> Option<Query> {
        if self.system {
            None
        } else {
            self.handler.unsubscribe_query()
        }
    }

    pub(crate) fn revitalize(&self) {
        self.handler.revitalize();
    }

    /// Deliver one routed message to the handler
    pub(crate) fn dispatch(&self, connection: &SocketConnection, message: &InboundMessage) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.handler.handle(connection, message) {
            warn!(
                subscription_id = self.id,
                error = %e,
                "stream handler failed"
            );
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("system", &self.system)
            .field("authenticated", &self.authenticated)
            .field("confirmed", &self.is_confirmed())
            .field("invocations", &self.invocations())
            .field("identifiers", &self.identifiers)
            .finish_non_exhaustive()
    }
}

type SubscribeBuilder = Box<dyn Fn(&SocketConnection) -> Option<Query> + Send + Sync>;
type UnsubscribeBuilder = Box<dyn Fn() -> Option<Query> + Send + Sync>;

/// A [`StreamHandler`] that decodes each routed message into `T` and hands
/// it to a callback
///
/// This is the convenient path for the common case of one payload shape
/// per stream; implement [`StreamHandler`] directly when identifiers map
/// to different shapes.
pub struct TypedStream<T> {
    identifiers: Vec<String>,
    authenticated: bool,
    subscribe: Option<SubscribeBuilder>,
    unsubscribe: Option<UnsubscribeBuilder>,
    callback: Box<dyn Fn(T) + Send + Sync>,
}

impl<T: DeserializeOwned + Send + Sync + 'static> TypedStream<T> {
    /// A stream over `identifiers`, delivering decoded payloads to `callback`
    pub fn new(
        identifiers: impl IntoIterator<Item = impl Into<String>>,
        callback: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            identifiers: identifiers.into_iter().map(Into::into).collect(),
            authenticated: false,
            subscribe: None,
            unsubscribe: None,
            callback: Box::new(callback),
        }
    }

    /// Require an authenticated connection
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    /// Install the subscribe exchange
    pub fn with_subscribe(
        mut self,
        build: impl Fn(&SocketConnection) -> Option<Query> + Send + Sync + 'static,
    ) -> Self {
        self.subscribe = Some(Box::new(build));
        self
    }

    /// Install the unsubscribe exchange
    pub fn with_unsubscribe(
        mut self,
        build: impl Fn() -> Option<Query> + Send + Sync + 'static,
    ) -> Self {
        self.unsubscribe = Some(Box::new(build));
        self
    }
}

impl<T: DeserializeOwned + Send + Sync + 'static> StreamHandler for TypedStream<T> {
    fn identifiers(&self) -> Vec<String> {
        self.identifiers.clone()
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn subscribe_query(&self, connection: &SocketConnection) -> Option<Query> {
        self.subscribe.as_ref().and_then(|build| build(connection))
    }

    fn unsubscribe_query(&self) -> Option<Query> {
        self.unsubscribe.as_ref().and_then(|build| build())
    }

    fn handle(&self, _connection: &SocketConnection, message: &InboundMessage) -> SocketResult<()> {
        let payload: T = serde_json::from_value(message.value.clone())
            .map_err(|e| SocketError::deserialize(format!("typed stream decode: {e}")))?;
        (self.callback)(payload);
        Ok(())
    }
}
