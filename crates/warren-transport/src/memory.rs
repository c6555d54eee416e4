//! In-process broker.
//!
//! [`MemoryBroker`] models the parts of AMQP 0-9-1 that the framework relies
//! on: exchanges with topic/direct/fanout routing, the default exchange,
//! per-consumer prefetch, delivery tags scoped to a connection, requeue at
//! the head of the queue, dead-lettering on reject, and redelivery of
//! unacked messages when a connection closes. Every operation performed
//! through a gateway is recorded so tests can assert on exact broker
//! traffic.
//!
//! Message TTLs are accepted but not enforced.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;
use warren_core::{
    BindingSpec, BoxedGateway, BrokerGateway, Connector, DeliveryStream, DeliveryTag,
    ExchangeKind, ExchangeSpec, GatewayError, GatewayResult, Headers, InboundMessage,
    OutboundMessage, QueueSpec, TopicPattern,
};

/// A broker operation performed through a gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayOp {
    Consume { queue: String, prefetch: u16 },
    Ack(DeliveryTag),
    Nack { tag: DeliveryTag, requeue: bool },
    Publish(OutboundMessage),
    DeclareQueue(String),
    DeclareExchange(String),
    Bind(BindingSpec),
    Close,
}

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    headers: Headers,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    redelivered: bool,
}

impl From<OutboundMessage> for Stored {
    fn from(message: OutboundMessage) -> Self {
        Self {
            exchange: message.exchange,
            routing_key: message.routing_key,
            payload: message.payload,
            headers: message.headers,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            redelivered: false,
        }
    }
}

struct MemQueue {
    spec: QueueSpec,
    messages: VecDeque<Stored>,
    /// Connection owning an exclusive queue.
    owner: Option<u64>,
}

struct Unacked {
    gateway: u64,
    consumer: u64,
    queue: String,
    message: Stored,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<BindingSpec>,
    unacked: BTreeMap<u64, Unacked>,
    last_tag: u64,
    last_gateway: u64,
    last_consumer: u64,
    open: HashSet<u64>,
    ops: Vec<GatewayOp>,
    fail_publishes: bool,
}

impl BrokerState {
    /// Queues receiving a message published to `exchange` with `routing_key`.
    fn route(&self, exchange: &str, routing_key: &str) -> GatewayResult<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| GatewayError::PublishFailed {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: "no such exchange".into(),
            })?;

        let mut targets = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => TopicPattern::parse(&binding.routing_key)
                    .map(|p| p.matches(routing_key))
                    .unwrap_or(false),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, exchange: &str, routing_key: &str, message: Stored) -> GatewayResult<()> {
        let targets = self.route(exchange, routing_key)?;
        if targets.is_empty() {
            trace!(exchange, routing_key, "Dropping unroutable message");
        }
        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.messages.push_back(message.clone());
            }
        }
        Ok(())
    }

    /// Puts an unacked message back at the head of its queue.
    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.messages.push_front(message);
        }
    }

    fn dead_letter(&mut self, unacked: Unacked) {
        let Some(queue) = self.queues.get(&unacked.queue) else {
            return;
        };
        let Some(exchange) = queue.spec.dead_letter_exchange.clone() else {
            trace!(queue = %unacked.queue, "Discarding rejected message");
            return;
        };
        let routing_key = queue
            .spec
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| unacked.message.routing_key.clone());

        let mut message = unacked.message;
        message.redelivered = false;
        message
            .headers
            .insert("x-first-death-queue".into(), Value::String(unacked.queue));
        message
            .headers
            .insert("x-first-death-reason".into(), Value::String("rejected".into()));

        if let Err(e) = self.enqueue(&exchange, &routing_key, message) {
            debug!(error = %e, "Dead-letter exchange is missing, message dropped");
        }
    }

    /// Requeues every unacked delivery of `gateway`, newest first so the
    /// oldest ends up at the head.
    fn release(&mut self, gateway: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .rev()
            .filter(|(_, u)| u.gateway == gateway)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }

    fn in_flight(&self, consumer: u64) -> usize {
        self.unacked.values().filter(|u| u.consumer == consumer).count()
    }

    fn take_unacked(&mut self, gateway: u64, tag: DeliveryTag) -> GatewayResult<Unacked> {
        match self.unacked.get(&tag.get()) {
            Some(u) if u.gateway == gateway => {}
            _ => return Err(GatewayError::UnknownDeliveryTag(tag.get())),
        }
        self.unacked
            .remove(&tag.get())
            .ok_or(GatewayError::UnknownDeliveryTag(tag.get()))
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    changed: Notify,
}

impl Shared {
    fn update<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        let result = f(&mut self.state.lock());
        self.changed.notify_waiters();
        result
    }
}

/// Broker living in the current process.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Opens a new connection.
    pub fn connect(&self) -> BoxedGateway {
        let id = self.shared.update(|state| {
            state.last_gateway += 1;
            state.open.insert(state.last_gateway);
            state.last_gateway
        });
        Arc::new(MemoryGateway {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Places a message directly on `queue`, bypassing exchanges. Not recorded.
    pub fn inject(&self, queue: &str, message: OutboundMessage) {
        self.shared.update(|state| {
            let queue = state
                .queues
                .entry(queue.to_string())
                .or_insert_with(|| MemQueue {
                    spec: QueueSpec::durable(queue),
                    messages: VecDeque::new(),
                    owner: None,
                });
            queue.messages.push_back(message.into());
        });
    }

    /// Operations recorded so far.
    pub fn ops(&self) -> Vec<GatewayOp> {
        self.shared.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.shared.state.lock().ops.clear();
    }

    /// Makes every following publish fail until switched off again.
    pub fn fail_publishes(&self, fail: bool) {
        self.shared.state.lock().fail_publishes = fail;
    }

    /// Ready messages on `queue`; zero when the queue does not exist.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.shared.state.lock().exchanges.contains_key(exchange)
    }

    pub fn bindings(&self) -> Vec<BindingSpec> {
        self.shared.state.lock().bindings.clone()
    }

    /// Deliveries handed out and not yet settled, across all connections.
    pub fn unacked_count(&self) -> usize {
        self.shared.state.lock().unacked.len()
    }

    /// Drops every connection as if the broker went away.
    pub fn disconnect_all(&self) {
        self.shared.update(|state| {
            let open: Vec<u64> = state.open.drain().collect();
            for id in open {
                state.release(id);
            }
        });
    }

    /// Copies of the ready messages on `queue`, head first.
    pub fn peek(&self, queue: &str) -> Vec<InboundMessage> {
        let state = self.shared.state.lock();
        let Some(q) = state.queues.get(queue) else {
            return Vec::new();
        };
        q.messages
            .iter()
            .map(|m| to_inbound(queue, m.clone(), DeliveryTag::new(0)))
            .collect()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MemoryBroker")
            .field("queues", &state.queues.len())
            .field("exchanges", &state.exchanges.len())
            .field("unacked", &state.unacked.len())
            .finish()
    }
}

fn to_inbound(queue: &str, message: Stored, tag: DeliveryTag) -> InboundMessage {
    InboundMessage {
        queue: queue.to_string(),
        exchange: message.exchange,
        routing_key: message.routing_key,
        payload: message.payload,
        headers: message.headers,
        correlation_id: message.correlation_id,
        reply_to: message.reply_to,
        redelivered: message.redelivered,
        delivery_tag: tag,
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryGateway {
    id: u64,
    shared: Arc<Shared>,
}

impl MemoryGateway {
    fn with_open<R>(
        &self,
        f: impl FnOnce(&mut BrokerState) -> GatewayResult<R>,
    ) -> GatewayResult<R> {
        self.shared.update(|state| {
            if !state.open.contains(&self.id) {
                return Err(GatewayError::Closed);
            }
            f(state)
        })
    }
}

enum Poll {
    Ready(InboundMessage),
    Failed(GatewayError),
    Wait,
}

struct ConsumerState {
    shared: Arc<Shared>,
    gateway: u64,
    consumer: u64,
    queue: String,
    prefetch: u16,
    done: bool,
}

impl ConsumerState {
    fn poll(&self) -> Poll {
        let mut state = self.shared.state.lock();
        if !state.open.contains(&self.gateway) {
            return Poll::Failed(GatewayError::Closed);
        }
        if !state.queues.contains_key(&self.queue) {
            return Poll::Failed(GatewayError::ConsumerCancelled(self.queue.clone()));
        }
        if self.prefetch > 0 && state.in_flight(self.consumer) >= usize::from(self.prefetch) {
            return Poll::Wait;
        }

        let next = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.messages.pop_front());
        let Some(message) = next else {
            return Poll::Wait;
        };

        state.last_tag += 1;
        let tag = state.last_tag;
        state.unacked.insert(
            tag,
            Unacked {
                gateway: self.gateway,
                consumer: self.consumer,
                queue: self.queue.clone(),
                message: message.clone(),
            },
        );
        Poll::Ready(to_inbound(&self.queue, message, DeliveryTag::new(tag)))
    }
}

#[async_trait]
impl BrokerGateway for MemoryGateway {
    async fn consume(&self, queue: &str, prefetch: u16) -> GatewayResult<DeliveryStream> {
        let consumer = self.with_open(|state| {
            if !state.queues.contains_key(queue) {
                return Err(GatewayError::channel(format!("no queue '{queue}'")));
            }
            state.last_consumer += 1;
            state.ops.push(GatewayOp::Consume {
                queue: queue.to_string(),
                prefetch,
            });
            Ok(state.last_consumer)
        })?;

        let consumer = ConsumerState {
            shared: Arc::clone(&self.shared),
            gateway: self.id,
            consumer,
            queue: queue.to_string(),
            prefetch,
            done: false,
        };

        let stream = futures::stream::unfold(consumer, |mut consumer| async move {
            if consumer.done {
                return None;
            }
            loop {
                let shared = Arc::clone(&consumer.shared);
                let changed = shared.changed.notified();
                match consumer.poll() {
                    Poll::Ready(message) => return Some((Ok(message), consumer)),
                    Poll::Failed(e) => {
                        consumer.done = true;
                        return Some((Err(e), consumer));
                    }
                    Poll::Wait => changed.await,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> GatewayResult<()> {
        self.with_open(|state| {
            state.take_unacked(self.id, tag)?;
            state.ops.push(GatewayOp::Ack(tag));
            Ok(())
        })
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> GatewayResult<()> {
        self.with_open(|state| {
            let unacked = state.take_unacked(self.id, tag)?;
            state.ops.push(GatewayOp::Nack { tag, requeue });
            if requeue {
                state.requeue(unacked);
            } else {
                state.dead_letter(unacked);
            }
            Ok(())
        })
    }

    async fn publish(&self, message: OutboundMessage) -> GatewayResult<()> {
        self.with_open(|state| {
            if state.fail_publishes {
                return Err(GatewayError::PublishFailed {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    reason: "publishing disabled".into(),
                });
            }
            let (exchange, routing_key) = (message.exchange.clone(), message.routing_key.clone());
            state.enqueue(&exchange, &routing_key, message.clone().into())?;
            state.ops.push(GatewayOp::Publish(message));
            Ok(())
        })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> GatewayResult<String> {
        self.with_open(|state| {
            let name = if spec.name.is_empty() {
                format!("amq.gen-{}", Uuid::new_v4().simple())
            } else {
                spec.name.clone()
            };

            match state.queues.get(&name) {
                Some(existing) if existing.owner.is_some_and(|owner| owner != self.id) => {
                    return Err(GatewayError::topology(
                        &name,
                        "queue is exclusive to another connection",
                    ));
                }
                Some(_) => {}
                None => {
                    let mut spec = spec.clone();
                    spec.name = name.clone();
                    state.queues.insert(
                        name.clone(),
                        MemQueue {
                            owner: spec.exclusive.then_some(self.id),
                            spec,
                            messages: VecDeque::new(),
                        },
                    );
                }
            }
            state.ops.push(GatewayOp::DeclareQueue(name.clone()));
            Ok(name)
        })
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> GatewayResult<()> {
        self.with_open(|state| {
            match state.exchanges.get(&spec.name) {
                Some(kind) if *kind != spec.kind => {
                    return Err(GatewayError::topology(
                        &spec.name,
                        format!("already declared as {kind}"),
                    ));
                }
                Some(_) => {}
                None => {
                    state.exchanges.insert(spec.name.clone(), spec.kind);
                }
            }
            state.ops.push(GatewayOp::DeclareExchange(spec.name.clone()));
            Ok(())
        })
    }

    async fn bind(&self, binding: &BindingSpec) -> GatewayResult<()> {
        self.with_open(|state| {
            if !state.exchanges.contains_key(&binding.exchange) {
                return Err(GatewayError::topology(&binding.exchange, "no such exchange"));
            }
            if !state.queues.contains_key(&binding.queue) {
                return Err(GatewayError::topology(&binding.queue, "no such queue"));
            }
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
            state.ops.push(GatewayOp::Bind(binding.clone()));
            Ok(())
        })
    }

    async fn close(&self) -> GatewayResult<()> {
        self.shared.update(|state| {
            if !state.open.remove(&self.id) {
                return;
            }
            state.release(self.id);
            state.queues.retain(|_, q| q.owner != Some(self.id));
            state.ops.push(GatewayOp::Close);
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.state.lock().open.contains(&self.id)
    }
}

/// [`Connector`] handing out connections to a shared [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    failures: Arc<AtomicU32>,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            failures: Arc::default(),
        }
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> GatewayResult<BoxedGateway> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(GatewayError::ConnectionFailed {
                url: self.describe(),
                reason: "connection refused".into(),
            });
        }
        Ok(self.broker.connect())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_core::Topology;

    async fn next(stream: &mut DeliveryStream) -> InboundMessage {
        stream.next().await.unwrap().unwrap()
    }

    async fn topology(gateway: &BoxedGateway) {
        let mut topology = Topology::new();
        topology.add_exchange(ExchangeSpec::topic("orders"));
        topology.add_queue(QueueSpec::durable("orders.eu"));
        topology.add_queue(QueueSpec::durable("orders.all"));
        topology.add_binding(BindingSpec::new("orders.eu", "orders", "orders.eu.*"));
        topology.add_binding(BindingSpec::new("orders.all", "orders", "orders.#"));
        topology.apply(gateway.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_routing() {
        let broker = MemoryBroker::new();
        let gateway = broker.connect();
        topology(&gateway).await;

        for key in ["orders.eu.created", "orders.us.created", "invoices.paid"] {
            gateway
                .publish(OutboundMessage::new("orders", key, b"{}".to_vec()))
                .await
                .unwrap();
        }

        assert_eq!(broker.queue_len("orders.eu"), 1);
        assert_eq!(broker.queue_len("orders.all"), 2);
    }

    #[tokio::test]
    async fn test_default_exchange_and_unknown_exchange() {
        let broker = MemoryBroker::new();
        let gateway = broker.connect();
        gateway.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();

        gateway
            .publish(OutboundMessage::new("", "jobs", b"1".to_vec()))
            .await
            .unwrap();
        // unroutable on the default exchange is dropped
        gateway
            .publish(OutboundMessage::new("", "nowhere", b"1".to_vec()))
            .await
            .unwrap();
        assert_eq!(broker.queue_len("jobs"), 1);

        let err = gateway
            .publish(OutboundMessage::new("missing", "jobs", b"1".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PublishFailed { .. }));
    }

    #[tokio::test]
    async fn test_prefetch_and_ack() {
        let broker = MemoryBroker::new();
        let gateway = broker.connect();
        gateway.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
        for i in 0..3 {
            broker.inject("jobs", OutboundMessage::new("", "jobs", vec![b'0' + i]));
        }

        let mut stream = gateway.consume("jobs", 2).await.unwrap();
        let first = next(&mut stream).await;
        let second = next(&mut stream).await;
        assert_eq!(broker.queue_len("jobs"), 1);
        assert_eq!(broker.unacked_count(), 2);

        // third delivery waits for a free prefetch slot
        let waiting = tokio::time::timeout(std::time::Duration::from_millis(20), stream.next()).await;
        assert!(waiting.is_err());

        gateway.ack(first.delivery_tag).await.unwrap();
        let third = next(&mut stream).await;
        assert_eq!(third.payload, b"2".to_vec());

        gateway.ack(second.delivery_tag).await.unwrap();
        gateway.ack(third.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);

        // double ack is a protocol error
        let err = gateway.ack(first.delivery_tag).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownDeliveryTag(_)));
    }

    #[tokio::test]
    async fn test_nack_requeue_goes_to_head() {
        let broker = MemoryBroker::new();
        let gateway = broker.connect();
        gateway.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
        broker.inject("jobs", OutboundMessage::new("", "a", b"a".to_vec()));
        broker.inject("jobs", OutboundMessage::new("", "b", b"b".to_vec()));

        let mut stream = gateway.consume("jobs", 1).await.unwrap();
        let a = next(&mut stream).await;
        assert!(!a.redelivered);
        gateway.nack(a.delivery_tag, true).await.unwrap();

        let again = next(&mut stream).await;
        assert_eq!(again.routing_key, "a");
        assert!(again.redelivered);
        assert_ne!(again.delivery_tag, a.delivery_tag);
    }

    #[tokio::test]
    async fn test_reject_dead_letters() {
        let broker = MemoryBroker::new();
        let gateway = broker.connect();
        let mut topology = Topology::new();
        topology.add_exchange(ExchangeSpec::topic("dlx"));
        topology.add_queue(QueueSpec::durable("jobs").with_dead_letter("dlx", None));
        topology.add_queue(QueueSpec::durable("jobs.dead"));
        topology.add_binding(BindingSpec::new("jobs.dead", "dlx", "#"));
        topology.apply(gateway.as_ref()).await.unwrap();

        broker.inject("jobs", OutboundMessage::new("", "jobs.run", b"x".to_vec()));
        let mut stream = gateway.consume("jobs", 1).await.unwrap();
        let message = next(&mut stream).await;
        gateway.nack(message.delivery_tag, false).await.unwrap();

        let dead = broker.peek("jobs.dead");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].routing_key, "jobs.run");
        assert_eq!(
            dead[0].headers.get("x-first-death-queue"),
            Some(&Value::String("jobs".into()))
        );
    }

    #[tokio::test]
    async fn test_close_redelivers_and_drops_exclusive() {
        let broker = MemoryBroker::new();
        let gateway = broker.connect();
        gateway.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
        let reply = gateway.declare_queue(&QueueSpec::exclusive("")).await.unwrap();
        assert!(reply.starts_with("amq.gen-"));

        broker.inject("jobs", OutboundMessage::new("", "jobs", b"x".to_vec()));
        let mut stream = gateway.consume("jobs", 1).await.unwrap();
        next(&mut stream).await;

        gateway.close().await.unwrap();
        assert!(!gateway.is_connected());
        assert_eq!(broker.queue_len("jobs"), 1);
        assert!(!broker.has_queue(&reply));
        assert!(matches!(stream.next().await, Some(Err(GatewayError::Closed))));
        assert!(stream.next().await.is_none());

        // a new connection sees the message flagged as redelivered
        let other = broker.connect();
        let mut stream = other.consume("jobs", 1).await.unwrap();
        assert!(next(&mut stream).await.redelivered);
    }

    #[tokio::test]
    async fn test_foreign_tag_rejected() {
        let broker = MemoryBroker::new();
        let owner = broker.connect();
        let other = broker.connect();
        owner.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
        broker.inject("jobs", OutboundMessage::new("", "jobs", b"x".to_vec()));

        let mut stream = owner.consume("jobs", 1).await.unwrap();
        let message = next(&mut stream).await;
        assert!(other.ack(message.delivery_tag).await.is_err());
        assert!(owner.ack(message.delivery_tag).await.is_ok());
    }

    #[tokio::test]
    async fn test_connector_failures() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        connector.fail_next_connects(2);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
    }
}
