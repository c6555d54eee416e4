//! # Warren Transport
//!
//! Concrete [`BrokerGateway`](warren_core::BrokerGateway) implementations.
//!
//! ## Features
//!
//! - `amqp`: RabbitMQ and other AMQP 0-9-1 brokers through `lapin`
//!
//! The in-process [`memory`] broker is always available. It backs the test
//! suites of the other crates and is handy for running a service without a
//! broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  warren-runtime     │  (consumers, supervision)
//! ├─────────────────────┤
//! │  warren-core        │  (BrokerGateway / Connector traits)
//! ├─────────────────────┤
//! │  warren-transport   │  <- This crate (implementations)
//! ├─────────────────────┤
//! │  Broker (AMQP/TCP)  │
//! └─────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use warren_transport::memory::MemoryBroker;
//! use warren_core::{OutboundMessage, QueueSpec};
//!
//! let broker = MemoryBroker::new();
//! let gateway = broker.connect();
//! gateway.declare_queue(&QueueSpec::durable("jobs")).await?;
//! gateway.publish(OutboundMessage::new("", "jobs", b"{}".to_vec())).await?;
//!
//! let mut deliveries = gateway.consume("jobs", 10).await?;
//! while let Some(message) = deliveries.next().await {
//!     let message = message?;
//!     gateway.ack(message.delivery_tag).await?;
//! }
//! ```

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use memory::{GatewayOp, MemoryBroker, MemoryConnector, MemoryGateway};

#[cfg(feature = "amqp")]
pub use amqp::{AmqpConnector, AmqpGateway};
