//! Inbound message interpretation
//!
//! Every frame coming off a transport passes through the same three steps:
//! an optional byte-level interceptor (decompression and the like), a JSON
//! envelope parse, and identifier extraction through the protocol hook.
//! Interpretation is total: a frame either becomes an [`InboundMessage`]
//! carrying zero or more routing identifiers, or it is unparseable and the
//! raw bytes go to the unparsed-message sink.

use std::sync::Arc;
use std::time::Instant;

use sockmux_types::{SocketError, SocketResult};

use crate::protocol::SocketProtocol;

/// Byte-level transform applied before parsing (e.g. gzip inflate)
pub type Interceptor = Arc<dyn Fn(&[u8]) -> SocketResult<Vec<u8>> + Send + Sync>;

/// A parsed inbound frame, ready for routing
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Parsed JSON envelope
    pub value: serde_json::Value,
    /// Routing identifiers claimed by this frame; may be empty
    pub identifiers: Vec<String>,
    /// Original frame bytes, kept only when the client asks for them
    pub raw: Option<Vec<u8>>,
    /// When the frame came off the transport
    pub received_at: Instant,
}

impl InboundMessage {
    /// True when any of `claims` appears in this frame's identifiers
    pub fn claimed_by(&self, claims: &[String]) -> bool {
        self.identifiers.iter().any(|id| claims.contains(id))
    }
}

/// The per-frame interpretation chain for one connection
pub struct MessagePipeline {
    protocol: Arc<dyn SocketProtocol>,
    interceptor: Option<Interceptor>,
    keep_raw: bool,
}

impl MessagePipeline {
    pub fn new(
        protocol: Arc<dyn SocketProtocol>,
        interceptor: Option<Interceptor>,
        keep_raw: bool,
    ) -> Self {
        Self {
            protocol,
            interceptor,
            keep_raw,
        }
    }

    /// Interpret one raw frame
    ///
    /// Errors mean the frame is unparseable; the caller routes the raw bytes
    /// to the unparsed sink and carries on.
    pub fn interpret(&self, raw: &[u8]) -> SocketResult<InboundMessage> {
        let received_at = Instant::now();

        let payload;
        let bytes: &[u8] = match &self.interceptor {
            Some(intercept) => {
                payload = intercept(raw)?;
                &payload
            }
            None => raw,
        };

        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| SocketError::deserialize(format!("invalid envelope: {e}")))?;

        let identifiers = self.protocol.identify(&value);

        Ok(InboundMessage {
            value,
            identifiers,
            raw: self.keep_raw.then(|| raw.to_vec()),
            received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TopicProtocol;

    impl SocketProtocol for TopicProtocol {
        fn identify(&self, value: &serde_json::Value) -> Vec<String> {
            value["topic"]
                .as_str()
                .map(|t| vec![t.to_string()])
                .unwrap_or_default()
        }
    }

    fn pipeline(keep_raw: bool) -> MessagePipeline {
        MessagePipeline::new(Arc::new(TopicProtocol), None, keep_raw)
    }

    #[test]
    fn frame_yields_identifiers() {
        let msg = pipeline(false)
            .interpret(br#"{"topic":"trades.BTC","data":[1,2]}"#)
            .unwrap();
        assert_eq!(msg.identifiers, vec!["trades.BTC"]);
        assert!(msg.raw.is_none());
        assert_eq!(msg.value["data"], json!([1, 2]));
    }

    #[test]
    fn frame_without_topic_yields_no_identifiers() {
        let msg = pipeline(false).interpret(br#"{"op":"ack","id":7}"#).unwrap();
        assert!(msg.identifiers.is_empty());
    }

    #[test]
    fn garbage_is_unparseable() {
        assert!(pipeline(false).interpret(b"\x00\x01not json").is_err());
    }

    #[test]
    fn raw_bytes_kept_when_requested() {
        let msg = pipeline(true).interpret(br#"{"topic":"t"}"#).unwrap();
        assert_eq!(msg.raw.as_deref(), Some(br#"{"topic":"t"}"# as &[u8]));
    }

    #[test]
    fn interceptor_runs_before_parse() {
        // Strip a one-byte length prefix before parsing
        let interceptor: Interceptor = Arc::new(|raw| Ok(raw[1..].to_vec()));
        let pipeline = MessagePipeline::new(Arc::new(TopicProtocol), Some(interceptor), false);

        let mut framed = vec![0xFF];
        framed.extend_from_slice(br#"{"topic":"x"}"#);
        let msg = pipeline.interpret(&framed).unwrap();
        assert_eq!(msg.identifiers, vec!["x"]);
    }

    #[test]
    fn claimed_by_intersects() {
        let msg = pipeline(false).interpret(br#"{"topic":"a"}"#).unwrap();
        assert!(msg.claimed_by(&["a".to_string(), "b".to_string()]));
        assert!(!msg.claimed_by(&["c".to_string()]));
    }
}
