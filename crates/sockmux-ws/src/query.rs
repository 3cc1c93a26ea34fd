//! One-shot request/response exchanges
//!
//! A [`Query`] pairs an outbound request with the predicate that
//! recognizes its reply among all inbound traffic. The connection keeps
//! pending queries in insertion order and completes each one at most once:
//! on a matching frame, on timeout, or on cancellation.

use std::time::Duration;

use sockmux_types::{SocketError, SocketResult};

use crate::message::InboundMessage;

type Matcher = Box<dyn Fn(&InboundMessage) -> bool + Send + Sync>;
type Acceptor = Box<dyn Fn(&InboundMessage) -> SocketResult<serde_json::Value> + Send + Sync>;

/// A request awaiting its matching reply
pub struct Query {
    request: serde_json::Value,
    authenticated: bool,
    timeout: Option<Duration>,
    matcher: Matcher,
    acceptor: Acceptor,
}

impl Query {
    /// Build a query from a request payload and a reply predicate
    ///
    /// By default a matching reply is accepted verbatim; use
    /// [`with_acceptor`](Self::with_acceptor) to turn server-side rejections
    /// into errors.
    pub fn new(
        request: serde_json::Value,
        matcher: impl Fn(&InboundMessage) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            request,
            authenticated: false,
            timeout: None,
            matcher: Box::new(matcher),
            acceptor: Box::new(|msg| Ok(msg.value.clone())),
        }
    }

    /// Mark this query as requiring an authenticated connection
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    /// Override the client-wide response window for this query
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Install the check that separates acks from server-side rejections
    pub fn with_acceptor(
        mut self,
        acceptor: impl Fn(&InboundMessage) -> SocketResult<serde_json::Value> + Send + Sync + 'static,
    ) -> Self {
        self.acceptor = Box::new(acceptor);
        self
    }

    /// The outbound request payload
    pub fn request(&self) -> &serde_json::Value {
        &self.request
    }

    /// Whether this query may only run on an authenticated connection
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Per-query timeout override, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// True when `message` is this query's reply
    pub fn matches(&self, message: &InboundMessage) -> bool {
        (self.matcher)(message)
    }

    /// Evaluate a matching reply into the query outcome
    pub fn accept(&self, message: &InboundMessage) -> SocketResult<serde_json::Value> {
        (self.acceptor)(message)
    }

    /// Serialize the request for the wire
    pub fn frame(&self) -> SocketResult<String> {
        serde_json::to_string(&self.request).map_err(SocketError::from)
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("request", &self.request)
            .field("authenticated", &self.authenticated)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Build a query matched by a numeric `id` echoed in the reply
///
/// Covers the common envelope where requests carry `"id": n` and replies
/// echo it back.
pub fn id_matched(request: serde_json::Value, id: u64) -> Query {
    Query::new(request, move |msg| {
        msg.value.get("id").and_then(|v| v.as_u64()) == Some(id)
    })
}
