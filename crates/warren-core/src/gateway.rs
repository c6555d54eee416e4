//! The broker boundary.
//!
//! [`BrokerGateway`] is everything Warren needs from an AMQP-compatible
//! broker. A gateway owns one connection and one channel; publish, ack and
//! nack calls on it are serialized by the implementation. [`Connector`]
//! creates gateways so the runtime can reconnect after a failure.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::GatewayResult;
use crate::message::{DeliveryTag, InboundMessage, OutboundMessage, Settlement};
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};

/// Stream of deliveries from one queue.
///
/// An `Err` item or the end of the stream means the consumer is gone; the
/// session holding it must be torn down.
pub type DeliveryStream = BoxStream<'static, GatewayResult<InboundMessage>>;

/// A connection to a message broker.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Starts consuming `queue` with at most `prefetch` unacked deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> GatewayResult<DeliveryStream>;

    /// Acknowledges a delivery.
    async fn ack(&self, tag: DeliveryTag) -> GatewayResult<()>;

    /// Rejects a delivery, optionally asking the broker to redeliver it.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> GatewayResult<()>;

    /// Publishes a message and waits for the broker to accept it.
    async fn publish(&self, message: OutboundMessage) -> GatewayResult<()>;

    /// Declares a queue, returning its name (generated when `spec.name` is empty).
    async fn declare_queue(&self, spec: &QueueSpec) -> GatewayResult<String>;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> GatewayResult<()>;

    async fn bind(&self, spec: &BindingSpec) -> GatewayResult<()>;

    /// Closes the connection. Unacked deliveries return to their queues.
    async fn close(&self) -> GatewayResult<()>;

    /// Returns `true` while the connection is usable.
    fn is_connected(&self) -> bool;

    /// Applies a [`Settlement`] to a delivery.
    async fn settle(&self, tag: DeliveryTag, settlement: Settlement) -> GatewayResult<()> {
        match settlement {
            Settlement::Ack => self.ack(tag).await,
            Settlement::NackRequeue => self.nack(tag, true).await,
            Settlement::NackDiscard => self.nack(tag, false).await,
        }
    }
}

/// A shared gateway.
pub type BoxedGateway = Arc<dyn BrokerGateway>;

/// Creates gateways.
///
/// The runtime calls [`connect`](Connector::connect) once per session, so a
/// connector must be able to produce a fresh connection after the previous one
/// failed.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> GatewayResult<BoxedGateway>;

    /// Human readable target, used in logs. Must not contain credentials.
    fn describe(&self) -> String;
}
