//! Message types exchanged with the broker.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Message headers. Values are JSON so they survive any broker encoding.
pub type Headers = BTreeMap<String, Value>;

/// Content type stamped on every message Warren publishes.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Opaque handle identifying a delivery on the gateway's channel.
///
/// Only the gateway that produced the tag may settle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message delivered by the broker.
///
/// Created by the gateway on delivery and consumed exactly once by the
/// dispatcher, which resolves its [`DeliveryTag`] to one [`Settlement`].
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Exchange the message was published to (empty for the default exchange).
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw body.
    pub payload: Vec<u8>,
    /// Application headers.
    pub headers: Headers,
    /// Correlation id for request/reply exchanges.
    pub correlation_id: Option<String>,
    /// Queue the caller expects a reply on.
    pub reply_to: Option<String>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// Settlement handle.
    pub delivery_tag: DeliveryTag,
}

impl InboundMessage {
    /// Creates a message with no headers, correlation or reply address.
    pub fn new(
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        delivery_tag: DeliveryTag,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: String::new(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            headers: Headers::new(),
            correlation_id: None,
            reply_to: None,
            redelivered: false,
            delivery_tag,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Returns `true` if the sender waits for a reply.
    pub fn expects_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Returns the payload as UTF-8 for logging, replacing invalid bytes.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Target exchange; empty string is the default (direct-to-queue) exchange.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Raw body.
    pub payload: Vec<u8>,
    /// Application headers.
    pub headers: Headers,
    /// Correlation id.
    pub correlation_id: Option<String>,
    /// Reply address for request/reply.
    pub reply_to: Option<String>,
    /// MIME content type.
    pub content_type: Option<String>,
}

impl OutboundMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            headers: Headers::new(),
            correlation_id: None,
            reply_to: None,
            content_type: None,
        }
    }

    /// Serializes `body` as JSON.
    pub fn json<T: Serialize + ?Sized>(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::new(exchange, routing_key, payload).with_content_type(JSON_CONTENT_TYPE))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A reply correlated to an inbound request.
///
/// Published on the default exchange with the request's `reply_to` as the
/// routing key.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundReply {
    /// Destination queue.
    pub reply_to: String,
    /// Correlation id copied from the request.
    pub correlation_id: Option<String>,
    /// Encoded body.
    pub payload: Vec<u8>,
    /// Reply headers.
    pub headers: Headers,
}

impl OutboundReply {
    /// Builds a reply addressed to the sender of `request`.
    ///
    /// Returns `None` when the request carries no reply address.
    pub fn to(request: &InboundMessage, payload: Vec<u8>, headers: Headers) -> Option<Self> {
        let reply_to = request.reply_to.clone()?;
        Some(Self {
            reply_to,
            correlation_id: request.correlation_id.clone(),
            payload,
            headers,
        })
    }

    /// Converts into a publishable message.
    pub fn into_message(self) -> OutboundMessage {
        let mut message = OutboundMessage::new("", self.reply_to, self.payload)
            .with_headers(self.headers)
            .with_content_type(JSON_CONTENT_TYPE);
        message.correlation_id = self.correlation_id;
        message
    }
}

/// Terminal acknowledgement outcome of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Settlement {
    /// Processed; removed from the queue.
    Ack,
    /// Rejected; the broker redelivers it.
    NackRequeue,
    /// Rejected; dropped or dead-lettered by the broker.
    NackDiscard,
}

impl Settlement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::NackRequeue => "nack_requeue",
            Self::NackDiscard => "nack_discard",
        }
    }
}

impl fmt::Display for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_requires_reply_to() {
        let request = InboundMessage::new("q", "rk", b"{}".to_vec(), DeliveryTag::new(1));
        assert!(OutboundReply::to(&request, Vec::new(), Headers::new()).is_none());
    }

    #[test]
    fn test_reply_goes_to_default_exchange() {
        let request = InboundMessage::new("rpc.echo", "echo", b"{}".to_vec(), DeliveryTag::new(7))
            .with_correlation_id("abc")
            .with_reply_to("reply.q");

        let reply = OutboundReply::to(&request, b"{\"v\":10}".to_vec(), Headers::new())
            .expect("reply address present")
            .into_message();

        assert_eq!(reply.exchange, "");
        assert_eq!(reply.routing_key, "reply.q");
        assert_eq!(reply.correlation_id.as_deref(), Some("abc"));
        assert_eq!(reply.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
    }

    #[test]
    fn test_outbound_json() {
        let msg = OutboundMessage::json("orders", "orders.eu.created", &json!({"id": 1}))
            .unwrap()
            .with_header("x-tenant", "acme");
        assert_eq!(msg.payload, br#"{"id":1}"#.to_vec());
        assert_eq!(msg.headers.get("x-tenant"), Some(&json!("acme")));
    }
}
