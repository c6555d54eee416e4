//! # Warren Core
//!
//! Foundation types for the Warren message-routing framework.
//!
//! Warren binds AMQP queues and routing keys to typed handlers. This crate
//! holds the pieces every other layer agrees on:
//!
//! - **Messages**: [`InboundMessage`], [`OutboundMessage`], [`OutboundReply`]
//!   and the terminal [`Settlement`] of a delivery
//! - **Context**: the per-message [`ExecutionContext`] threaded through pipes
//!   and interceptors
//! - **Errors**: [`GatewayError`], [`RouteNotFound`], [`ValidationError`],
//!   [`HandlerError`]
//! - **Topic patterns**: AMQP topic-exchange matching ([`TopicPattern`])
//! - **Broker boundary**: the [`BrokerGateway`] and [`Connector`] traits and
//!   the [`Topology`] declared through them
//!
//! ```text
//! ┌─────────────┐     ┌────────────┐     ┌────────┐     ┌──────────────┐     ┌─────────┐
//! │   Gateway   │────▶│ Dispatcher │────▶│ Router │────▶│ Pipes        │────▶│ Handler │
//! │  (broker)   │◀────│            │     └────────┘     │ Interceptors │     └─────────┘
//! └─────────────┘     └────────────┘                    └──────────────┘
//! ```

pub mod context;
pub mod error;
pub mod gateway;
pub mod message;
pub mod reply;
pub mod topic;
pub mod topology;

pub use context::ExecutionContext;
pub use error::{
    ErrorKind, GatewayError, GatewayResult, HandlerError, RouteNotFound, ValidationError,
};
pub use gateway::{BoxedGateway, BrokerGateway, Connector, DeliveryStream};
pub use message::{
    DeliveryTag, Headers, InboundMessage, JSON_CONTENT_TYPE, OutboundMessage, OutboundReply,
    Settlement,
};
pub use reply::{HandlerResult, Reply};
pub use topic::{PatternError, TopicPattern};
pub use topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, Topology};

/// Prelude for common imports.
pub mod prelude {
    pub use super::context::ExecutionContext;
    pub use super::error::{ErrorKind, HandlerError, ValidationError};
    pub use super::message::{Headers, InboundMessage, Settlement};
    pub use super::reply::{HandlerResult, Reply};
}
