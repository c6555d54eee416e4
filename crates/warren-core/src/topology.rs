//! Broker topology declarations.
//!
//! A [`Topology`] is the set of exchanges, queues and bindings a service
//! needs. The runtime derives one from the registry and configuration and
//! applies it through the gateway on every connect.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GatewayResult;
use crate::gateway::BrokerGateway;

/// AMQP exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exchange to declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// A durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn with_kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A queue to declare.
///
/// An empty `name` asks the broker to generate one; the generated name is
/// returned by [`BrokerGateway::declare_queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Exchange receiving messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when dead-lettering.
    pub dead_letter_routing_key: Option<String>,
    /// Per-message time to live.
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    /// A durable, shared queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }

    /// A private queue deleted with its connection, as used for RPC replies.
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key;
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}

/// Binds a queue to an exchange with a routing pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Everything a service declares on the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an exchange unless one with the same name is already present.
    pub fn add_exchange(&mut self, spec: ExchangeSpec) {
        if !self.exchanges.iter().any(|e| e.name == spec.name) {
            self.exchanges.push(spec);
        }
    }

    /// Adds a queue unless one with the same name is already present.
    pub fn add_queue(&mut self, spec: QueueSpec) {
        if !self.queues.iter().any(|q| q.name == spec.name) {
            self.queues.push(spec);
        }
    }

    /// Adds a binding, ignoring exact duplicates.
    pub fn add_binding(&mut self, spec: BindingSpec) {
        if !self.bindings.contains(&spec) {
            self.bindings.push(spec);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    /// Declares exchanges, then queues, then bindings.
    pub async fn apply(&self, gateway: &dyn BrokerGateway) -> GatewayResult<()> {
        for exchange in &self.exchanges {
            debug!(exchange = %exchange.name, kind = %exchange.kind, "Declaring exchange");
            gateway.declare_exchange(exchange).await?;
        }
        for queue in &self.queues {
            debug!(queue = %queue.name, durable = queue.durable, "Declaring queue");
            gateway.declare_queue(queue).await?;
        }
        for binding in &self.bindings {
            debug!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                "Binding queue"
            );
            gateway.bind(binding).await?;
        }
        Ok(())
    }
}
