//! Per-message dispatch and acknowledgement.
//!
//! The [`Dispatcher`] drives one delivery through the pipeline and settles
//! it exactly once:
//!
//! ```text
//! Received ──▶ Routed ──▶ Validated ──▶ Invoked ──▶ Acked
//!    │            │            │           ├──────▶ NackedRequeue  (transient, reply publish failed)
//!    └────────────┴────────────┴───────────┴──────▶ NackedDiscard  (unroutable, invalid, permanent, panic)
//! ```
//!
//! When a reply is due it is published *before* the ack, so a crash between
//! the two redelivers the request rather than losing the reply. Only a
//! failed success reply requeues; a failed error reply keeps the settlement
//! of the error it reports.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tower::Service;
use tracing::{Instrument, debug, debug_span, error, info, trace, warn};
use warren_core::{
    BoxedGateway, ErrorKind, ExecutionContext, GatewayError, GatewayResult, HandlerError,
    InboundMessage, OutboundReply, Reply, RouteNotFound, Settlement,
};

use crate::interceptor::panic_message;
use crate::pipe::PipeFailure;
use crate::registry::{HandlerEntry, Registry};
use crate::route::ReplyContract;
use crate::wire::{self, RemoteError};

/// Position of a message in the dispatch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Routed,
    Validated,
    Invoked,
    Acked,
    NackedRequeue,
    NackedDiscard,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acked | Self::NackedRequeue | Self::NackedDiscard)
    }
}

impl From<Settlement> for MessageState {
    fn from(settlement: Settlement) -> Self {
        match settlement {
            Settlement::Ack => Self::Acked,
            Settlement::NackRequeue => Self::NackedRequeue,
            Settlement::NackDiscard => Self::NackedDiscard,
        }
    }
}

/// Why a message was not acked normally.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error(transparent)]
    RouteNotFound(#[from] RouteNotFound),

    #[error("payload is not valid JSON: {0}")]
    Decode(String),

    #[error(transparent)]
    Pipe(#[from] PipeFailure),

    #[error("{handler} failed: {error}")]
    Handler { handler: String, error: HandlerError },

    /// A pipe or interceptor panicked. Handler panics surface as
    /// permanent [`HandlerError`]s instead.
    #[error("{handler} panicked: {message}")]
    Panic { handler: String, message: String },

    /// A pipe aborted the invocation. The message is acked.
    #[error("aborted: {reason}")]
    Aborted { reason: String },

    #[error("failed to encode reply: {0}")]
    Encode(String),

    #[error("failed to publish reply: {0}")]
    Reply(GatewayError),
}

impl DispatchError {
    /// The settlement this error forces.
    pub fn settlement(&self) -> Settlement {
        match self {
            Self::Handler { error, .. } if error.is_transient() => Settlement::NackRequeue,
            Self::Reply(_) => Settlement::NackRequeue,
            Self::Aborted { .. } => Settlement::Ack,
            _ => Settlement::NackDiscard,
        }
    }

    /// The `x-error-kind` value used in error replies.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            Self::RouteNotFound(_) => "route_not_found",
            Self::Decode(_) | Self::Pipe(_) => ErrorKind::Invalid.as_str(),
            Self::Handler { error, .. } => error.kind().as_str(),
            Self::Panic { .. } | Self::Encode(_) => ErrorKind::Permanent.as_str(),
            Self::Aborted { .. } => "aborted",
            Self::Reply(_) => ErrorKind::Transient.as_str(),
        }
    }

    fn to_remote(&self) -> RemoteError {
        match self {
            Self::Handler { error, .. } => {
                RemoteError::new(self.wire_kind(), error.message())
                    .with_code(error.code())
                    .with_data(error.data().cloned())
            }
            Self::Pipe(failure) => RemoteError::new(self.wire_kind(), failure.to_string())
                .with_data(failure.error.path.clone().map(|p| serde_json::json!({ "path": p }))),
            Self::Aborted { reason } => RemoteError::new(self.wire_kind(), reason.clone()),
            _ => RemoteError::new(self.wire_kind(), self.to_string()),
        }
    }
}

/// Result of dispatching one message.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub settlement: Settlement,
    /// Resolved handler, if routing succeeded.
    pub handler: Option<String>,
    pub error: Option<DispatchError>,
    /// Whether a reply (success or error) was published.
    pub replied: bool,
}

impl DispatchOutcome {
    pub fn state(&self) -> MessageState {
        self.settlement.into()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Options shared by every dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Stamped into the `x-service` header of replies.
    pub service_name: String,
    /// Log every inbound message and reply at `info`.
    pub log_messages: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            service_name: "warren".to_string(),
            log_messages: false,
        }
    }
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
    replies: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub replies: u64,
}

impl StatsSnapshot {
    /// Messages received but not yet settled.
    pub fn in_flight(&self) -> u64 {
        self.received
            .saturating_sub(self.acked + self.requeued + self.discarded)
    }
}

impl DispatchStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
        }
    }

    fn record(&self, settlement: Settlement) {
        let counter = match settlement {
            Settlement::Ack => &self.acked,
            Settlement::NackRequeue => &self.requeued,
            Settlement::NackDiscard => &self.discarded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of running a message through the pipeline, before settlement.
struct Processed {
    handler: Option<String>,
    error: Option<DispatchError>,
    reply: Option<OutboundReply>,
}

/// Drives messages through routing, pipes, interceptors and the handler.
///
/// Cheap to clone; clones share the registry, gateway and counters.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    gateway: BoxedGateway,
    options: Arc<DispatchOptions>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, gateway: BoxedGateway, options: DispatchOptions) -> Self {
        Self::with_stats(registry, gateway, options, Arc::default())
    }

    /// Creates a dispatcher recording into existing counters, so totals
    /// survive reconnects.
    pub fn with_stats(
        registry: Arc<Registry>,
        gateway: BoxedGateway,
        options: DispatchOptions,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            registry,
            gateway,
            options: Arc::new(options),
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Processes and settles one message.
    ///
    /// Per-message failures are reported in the outcome. An `Err` means the
    /// gateway could not settle the message; the session must end.
    pub async fn dispatch(&self, message: InboundMessage) -> GatewayResult<DispatchOutcome> {
        let span = debug_span!(
            "dispatch",
            queue = %message.queue,
            routing_key = %message.routing_key,
            delivery_tag = %message.delivery_tag,
            correlation_id = message.correlation_id.as_deref().unwrap_or(""),
        );
        self.settle_message(message).instrument(span).await
    }

    async fn settle_message(&self, message: InboundMessage) -> GatewayResult<DispatchOutcome> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        trace!(state = ?MessageState::Received, "Message received");
        if self.options.log_messages {
            info!(payload = %message.payload_lossy(), "Inbound message");
        }

        let tag = message.delivery_tag;
        let Processed {
            handler,
            mut error,
            reply,
        } = self.process(message).await;

        let mut replied = false;
        if let Some(reply) = reply {
            if self.options.log_messages {
                info!(
                    reply_to = %reply.reply_to,
                    payload = %String::from_utf8_lossy(&reply.payload),
                    "Outbound reply"
                );
            }
            match self.gateway.publish(reply.into_message()).await {
                Ok(()) => {
                    replied = true;
                    self.stats.replies.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if error.is_none() => {
                    warn!(error = %e, "Reply publish failed, requeueing");
                    error = Some(DispatchError::Reply(e));
                }
                Err(e) => warn!(error = %e, "Error reply publish failed"),
            }
        }

        let settlement = error
            .as_ref()
            .map_or(Settlement::Ack, DispatchError::settlement);

        if let Err(e) = self.gateway.settle(tag, settlement).await {
            error!(error = %e, %settlement, "Failed to settle message");
            return Err(e);
        }
        self.stats.record(settlement);

        match &error {
            None => debug!(state = ?MessageState::from(settlement), "Message settled"),
            Some(err) => warn!(
                state = ?MessageState::from(settlement),
                handler = handler.as_deref().unwrap_or("-"),
                error = %err,
                "Message settled after failure"
            ),
        }

        Ok(DispatchOutcome {
            settlement,
            handler,
            error,
            replied,
        })
    }

    async fn process(&self, message: InboundMessage) -> Processed {
        let entry = match self.registry.resolve(&message.queue, &message.routing_key) {
            Ok(entry) => entry,
            Err(not_found) => {
                let err = DispatchError::from(not_found);
                let reply = self.error_reply(&message, &err);
                return Processed {
                    handler: None,
                    error: Some(err),
                    reply,
                };
            }
        };

        let handler = entry.handler_ref().to_string();
        trace!(state = ?MessageState::Routed, %handler, "Message routed");

        let payload = match decode(&message.payload) {
            Ok(payload) => payload,
            Err(err) => {
                let reply = self.error_reply(&message, &err);
                return Processed {
                    handler: Some(handler),
                    error: Some(err),
                    reply,
                };
            }
        };

        let mut ctx = ExecutionContext::new(message, handler.clone());
        ctx.set_payload(payload);

        let result = AssertUnwindSafe(run_entry(&entry, &mut ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(DispatchError::Panic {
                    handler: handler.clone(),
                    message: panic_message(panic.as_ref()),
                })
            });

        let message = ctx.message();
        let wants_reply = entry.reply_contract() == ReplyContract::Rpc;

        match result {
            Ok(reply) => {
                let reply = if wants_reply {
                    match wire::success_reply(message, reply, &self.options.service_name) {
                        Ok(reply) => reply,
                        Err(e) => {
                            let err = DispatchError::Encode(e.to_string());
                            let reply = self.error_reply(message, &err);
                            return Processed {
                                handler: Some(handler),
                                error: Some(err),
                                reply,
                            };
                        }
                    }
                } else {
                    None
                };
                Processed {
                    handler: Some(handler),
                    error: None,
                    reply,
                }
            }
            Err(err) => {
                // validation failures always answer; handler-level failures
                // only when the route replies at all
                let reply = match &err {
                    DispatchError::Pipe(_) => self.error_reply(message, &err),
                    DispatchError::Handler { error, .. } if error.kind() == ErrorKind::Invalid => {
                        self.error_reply(message, &err)
                    }
                    _ if err.settlement() == Settlement::NackRequeue => None,
                    _ if wants_reply => self.error_reply(message, &err),
                    _ => None,
                };
                Processed {
                    handler: Some(handler),
                    error: Some(err),
                    reply,
                }
            }
        }
    }

    fn error_reply(&self, message: &InboundMessage, err: &DispatchError) -> Option<OutboundReply> {
        wire::error_reply(message, err.to_remote(), &self.options.service_name)
    }
}

/// Runs pipes, then interceptors and handler.
async fn run_entry(
    entry: &HandlerEntry,
    ctx: &mut ExecutionContext,
) -> Result<Option<Reply>, DispatchError> {
    entry.pipes().run(ctx).await?;

    if let Some(reason) = ctx.abort_reason() {
        return Err(DispatchError::Aborted {
            reason: reason.to_string(),
        });
    }
    trace!(state = ?MessageState::Validated, "Payload validated");

    let result = entry.invoke(ctx).await;
    trace!(state = ?MessageState::Invoked, ok = result.is_ok(), "Handler invoked");

    result.map_err(|error| DispatchError::Handler {
        handler: ctx.handler().to_string(),
        error,
    })
}

/// Decodes a JSON body. An empty body decodes to `null`.
fn decode(payload: &[u8]) -> Result<Value, DispatchError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(payload).map_err(|e| DispatchError::Decode(e.to_string()))
}

impl Service<InboundMessage> for Dispatcher {
    type Response = DispatchOutcome;
    type Error = GatewayError;
    type Future = BoxFuture<'static, Result<DispatchOutcome, GatewayError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.gateway.is_connected() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(GatewayError::Closed))
        }
    }

    fn call(&mut self, message: InboundMessage) -> Self::Future {
        let dispatcher = self.clone();
        async move { dispatcher.dispatch(message).await }.boxed()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::Payload;
    use crate::handler::Json;
    use crate::pipe::pipe_fn;
    use crate::route::{Controller, Route};
    use futures::StreamExt;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tower::ServiceExt;
    use warren_core::{
        BrokerGateway, DeliveryStream, OutboundMessage, QueueSpec, ValidationError,
    };
    use warren_transport::memory::{GatewayOp, MemoryBroker};

    #[derive(Deserialize)]
    struct EchoRequest {
        v: i64,
    }

    #[derive(Serialize)]
    struct EchoReply {
        v: i64,
    }

    async fn echo(Payload(req): Payload<EchoRequest>) -> Json<EchoReply> {
        Json(EchoReply { v: req.v * 2 })
    }

    async fn busy() -> Result<(), HandlerError> {
        Err(HandlerError::transient("database unavailable"))
    }

    async fn broken() -> Result<(), HandlerError> {
        Err(HandlerError::permanent("order cancelled").with_code(410))
    }

    async fn explode() {
        panic!("handler bug");
    }

    async fn notify() {}

    fn registry() -> Arc<Registry> {
        let mut builder = Registry::builder();
        builder
            .register(
                Controller::new("Rpc")
                    .queue("rpc.echo")
                    .route(Route::new("echo", echo))
                    .route(Route::new("busy", busy))
                    .route(Route::new("broken", broken))
                    .route(Route::new("explode", explode))
                    .route(Route::new("notify", notify).no_reply())
                    .route(Route::new("audit", echo).name("audit").no_reply())
                    .route(Route::new("fragile", notify).name("fragile").pipe(pipe_fn(
                        "fragile",
                        |_, _| panic!("pipe bug"),
                    )))
                    .route(Route::new("guarded", echo).name("guarded").pipe(pipe_fn(
                        "positive",
                        |v, _| match v.get("v").and_then(Value::as_i64) {
                            Some(n) if n > 0 => Ok(v),
                            _ => Err(ValidationError::at("v", "must be positive")),
                        },
                    )))
                    .route(Route::new("dedupe", echo).name("dedupe").pipe(pipe_fn(
                        "dedupe",
                        |v, ctx| {
                            ctx.abort("duplicate delivery");
                            Ok(v)
                        },
                    ))),
            )
            .unwrap();
        Arc::new(builder.build())
    }

    struct Harness {
        broker: MemoryBroker,
        dispatcher: Dispatcher,
        deliveries: DeliveryStream,
    }

    impl Harness {
        async fn new() -> Self {
            let broker = MemoryBroker::new();
            let gateway = broker.connect();
            gateway
                .declare_queue(&QueueSpec::durable("rpc.echo"))
                .await
                .unwrap();
            let deliveries = gateway.consume("rpc.echo", 16).await.unwrap();
            let options = DispatchOptions {
                service_name: "echo-service".into(),
                log_messages: false,
            };
            Self {
                dispatcher: Dispatcher::new(registry(), gateway, options),
                broker,
                deliveries,
            }
        }

        /// Delivers `message` on `rpc.echo` and dispatches it with a clean op log.
        async fn dispatch(&mut self, message: OutboundMessage) -> DispatchOutcome {
            self.broker.inject("rpc.echo", message);
            let delivery = self.deliveries.next().await.unwrap().unwrap();
            self.broker.clear_ops();
            self.dispatcher.dispatch(delivery).await.unwrap()
        }

        fn publishes(&self) -> Vec<OutboundMessage> {
            self.broker
                .ops()
                .into_iter()
                .filter_map(|op| match op {
                    GatewayOp::Publish(m) => Some(m),
                    _ => None,
                })
                .collect()
        }
    }

    fn request(routing_key: &str, payload: &str) -> OutboundMessage {
        OutboundMessage::new("", routing_key, payload.as_bytes().to_vec())
            .with_correlation_id("abc")
            .with_reply_to("reply.q")
    }

    #[tokio::test]
    async fn test_echo_rpc_replies_then_acks() {
        let mut h = Harness::new().await;

        let outcome = h.dispatch(request("echo", r#"{"v":5}"#)).await;

        assert_eq!(outcome.settlement, Settlement::Ack);
        assert!(outcome.replied);

        let ops = h.broker.ops();
        assert_eq!(ops.len(), 2, "publish then ack: {ops:?}");
        let GatewayOp::Publish(reply) = &ops[0] else {
            panic!("expected publish, got {:?}", ops[0]);
        };
        assert_eq!(reply.exchange, "");
        assert_eq!(reply.routing_key, "reply.q");
        assert_eq!(reply.correlation_id.as_deref(), Some("abc"));
        assert_eq!(
            serde_json::from_slice::<Value>(&reply.payload).unwrap(),
            json!({"v": 10})
        );
        assert!(matches!(ops[1], GatewayOp::Ack(_)));
    }

    #[tokio::test]
    async fn test_unroutable_is_discarded() {
        let mut h = Harness::new().await;

        let outcome = h
            .dispatch(OutboundMessage::new("", "nope", b"{}".to_vec()))
            .await;

        assert_eq!(outcome.settlement, Settlement::NackDiscard);
        assert!(matches!(outcome.error, Some(DispatchError::RouteNotFound(_))));
        assert!(matches!(
            h.broker.ops().as_slice(),
            [GatewayOp::Nack { requeue: false, .. }]
        ));
    }

    #[tokio::test]
    async fn test_unroutable_rpc_gets_error_reply() {
        let mut h = Harness::new().await;
        let outcome = h.dispatch(request("nope", "{}")).await;

        assert_eq!(outcome.settlement, Settlement::NackDiscard);
        let replies = h.publishes();
        assert_eq!(replies.len(), 1);
        let remote = RemoteError::from_headers(&replies[0].headers).unwrap();
        assert_eq!(remote.kind, "route_not_found");
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_without_reply() {
        let mut h = Harness::new().await;
        let outcome = h.dispatch(request("busy", "{}")).await;

        assert_eq!(outcome.settlement, Settlement::NackRequeue);
        assert!(h.publishes().is_empty());
        assert!(matches!(
            h.broker.ops().as_slice(),
            [GatewayOp::Nack { requeue: true, .. }]
        ));
        assert_eq!(h.broker.queue_len("rpc.echo"), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_replies_with_error_then_discards() {
        let mut h = Harness::new().await;
        let outcome = h.dispatch(request("broken", "{}")).await;

        assert_eq!(outcome.settlement, Settlement::NackDiscard);
        let ops = h.broker.ops();
        let GatewayOp::Publish(reply) = &ops[0] else {
            panic!("expected error reply, got {:?}", ops[0]);
        };
        assert_eq!(reply.correlation_id.as_deref(), Some("abc"));
        assert_eq!(reply.payload, b"null".to_vec());
        let remote = RemoteError::from_headers(&reply.headers).unwrap();
        assert_eq!(remote.kind, "permanent");
        assert_eq!(remote.message, "order cancelled");
        assert_eq!(remote.code, Some(410));
        assert_eq!(remote.service.as_deref(), Some("echo-service"));
        assert!(matches!(ops[1], GatewayOp::Nack { requeue: false, .. }));
    }

    #[tokio::test]
    async fn test_invalid_json_is_discarded_with_error_reply() {
        let mut h = Harness::new().await;
        let outcome = h.dispatch(request("echo", "{not json")).await;

        assert_eq!(outcome.settlement, Settlement::NackDiscard);
        assert!(matches!(outcome.error, Some(DispatchError::Decode(_))));
        let remote = RemoteError::from_headers(&h.publishes()[0].headers).unwrap();
        assert_eq!(remote.kind, "invalid");
    }

    #[tokio::test]
    async fn test_pipe_failure_skips_handler() {
        let mut h = Harness::new().await;
        let outcome = h.dispatch(request("guarded", r#"{"v":-1}"#)).await;

        assert_eq!(outcome.settlement, Settlement::NackDiscard);
        let Some(DispatchError::Pipe(failure)) = &outcome.error else {
            panic!("expected pipe failure, got {:?}", outcome.error);
        };
        assert_eq!(failure.pipe, "positive");
        let remote = RemoteError::from_headers(&h.publishes()[0].headers).unwrap();
        assert_eq!(remote.data, Some(json!({"path": "v"})));
    }

    #[tokio::test]
    async fn test_panic_is_permanent() {
        let mut h = Harness::new().await;
        let outcome = h.dispatch(request("explode", "{}")).await;

        assert_eq!(outcome.settlement, Settlement::NackDiscard);
        let Some(DispatchError::Handler { error, .. }) = &outcome.error else {
            panic!("expected handler error, got {:?}", outcome.error);
        };
        assert_eq!(error.kind(), ErrorKind::Permanent);
        assert_eq!(error.message(), "handler panicked: handler bug");
        let remote = RemoteError::from_headers(&h.publishes()[0].headers).unwrap();
        assert_eq!(remote.kind, "permanent");
    }

    #[tokio::test]
    async fn test_pipe_panic_is_discarded() {
        let mut h = Harness::new().await;
        let outcome = h.dispatch(request("fragile", "{}")).await;

        assert_eq!(outcome.settlement, Settlement::NackDiscard);
        let Some(DispatchError::Panic { message, .. }) = &outcome.error else {
            panic!("expected panic error, got {:?}", outcome.error);
        };
        assert_eq!(message, "pipe bug");
    }

    #[tokio::test]
    async fn test_abort_acks_with_aborted_reply() {
        let mut h = Harness::new().await;
        let outcome = h.dispatch(request("dedupe", r#"{"v":1}"#)).await;

        assert_eq!(outcome.settlement, Settlement::Ack);
        let remote = RemoteError::from_headers(&h.publishes()[0].headers).unwrap();
        assert_eq!(remote.kind, "aborted");
        assert_eq!(remote.message, "duplicate delivery");
    }

    #[tokio::test]
    async fn test_no_reply_contract() {
        let mut h = Harness::new().await;
        let outcome = h.dispatch(request("notify", "{}")).await;

        assert_eq!(outcome.settlement, Settlement::Ack);
        assert!(!outcome.replied);
        assert!(h.publishes().is_empty());
    }

    #[tokio::test]
    async fn test_no_reply_route_still_reports_bad_payload() {
        let mut h = Harness::new().await;
        let outcome = h.dispatch(request("audit", r#"{"value":3}"#)).await;

        assert_eq!(outcome.settlement, Settlement::NackDiscard);
        let replies = h.publishes();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].correlation_id.as_deref(), Some("abc"));
        let remote = RemoteError::from_headers(&replies[0].headers).unwrap();
        assert_eq!(remote.kind, "invalid");

        let outcome = h.dispatch(request("audit", r#"{"v":3}"#)).await;
        assert_eq!(outcome.settlement, Settlement::Ack);
        assert!(h.publishes().is_empty());
    }

    #[tokio::test]
    async fn test_reply_publish_failure_requeues() {
        let mut h = Harness::new().await;
        h.broker.fail_publishes(true);

        let outcome = h.dispatch(request("echo", r#"{"v":5}"#)).await;

        assert_eq!(outcome.settlement, Settlement::NackRequeue);
        assert!(matches!(outcome.error, Some(DispatchError::Reply(_))));
    }

    #[tokio::test]
    async fn test_error_reply_publish_failure_keeps_discard() {
        let mut h = Harness::new().await;
        h.broker.fail_publishes(true);

        let unroutable = h.dispatch(request("nope", "{}")).await;
        assert_eq!(unroutable.settlement, Settlement::NackDiscard);
        assert!(!unroutable.replied);
        assert!(matches!(
            unroutable.error,
            Some(DispatchError::RouteNotFound(_))
        ));
        assert!(matches!(
            h.broker.ops().as_slice(),
            [GatewayOp::Nack { requeue: false, .. }]
        ));

        let malformed = h.dispatch(request("echo", "{not json")).await;
        assert_eq!(malformed.settlement, Settlement::NackDiscard);
        assert!(matches!(malformed.error, Some(DispatchError::Decode(_))));

        assert_eq!(h.broker.queue_len("rpc.echo"), 0);
        assert_eq!(h.dispatcher.stats().snapshot().requeued, 0);
    }

    #[tokio::test]
    async fn test_every_message_settled_once() {
        let mut h = Harness::new().await;
        // requeued deliveries come back first, so the transient one goes last
        let keys = [
            "echo", "broken", "explode", "notify", "nope", "guarded", "dedupe", "busy",
        ];

        let mut settled = Vec::new();
        for key in keys {
            h.dispatch(request(key, r#"{"v":3}"#)).await;
            settled.extend(h.broker.ops().into_iter().filter_map(|op| match op {
                GatewayOp::Ack(tag) | GatewayOp::Nack { tag, .. } => Some(tag),
                _ => None,
            }));
        }

        assert_eq!(settled.len(), keys.len());
        let mut unique = settled.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), keys.len());

        let stats = h.dispatcher.stats().snapshot();
        assert_eq!(stats.received, keys.len() as u64);
        assert_eq!(stats.in_flight(), 0);
        assert_eq!(stats.requeued, 1);
    }

    #[tokio::test]
    async fn test_tower_service() {
        let mut h = Harness::new().await;
        h.broker.inject("rpc.echo", request("echo", r#"{"v":1}"#));
        let delivery = h.deliveries.next().await.unwrap().unwrap();

        let outcome = h.dispatcher.clone().oneshot(delivery).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.state(), MessageState::Acked);
    }

    #[test]
    fn test_decode_empty_body_is_null() {
        assert_eq!(decode(b"").unwrap(), Value::Null);
        assert_eq!(decode(b"  \n").unwrap(), Value::Null);
        assert!(decode(b"{").is_err());
    }

    #[test]
    fn test_error_settlements() {
        let transient = DispatchError::Handler {
            handler: "A::b".into(),
            error: HandlerError::transient("x"),
        };
        assert_eq!(transient.settlement(), Settlement::NackRequeue);
        let invalid = DispatchError::Handler {
            handler: "A::b".into(),
            error: HandlerError::invalid("x"),
        };
        assert_eq!(invalid.settlement(), Settlement::NackDiscard);
        assert_eq!(invalid.wire_kind(), "invalid");
    }
}
