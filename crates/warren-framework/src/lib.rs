//! # Warren Framework
//!
//! Declarative routing on top of the core types.
//!
//! This layer provides:
//! - Controllers and routes describing which handler serves which
//!   (queue, routing pattern) pair
//! - The metadata registry and router resolving deliveries to handlers
//! - Pipes for payload validation and transformation
//! - Interceptors wrapping handler invocation
//! - Axum-style handlers with extractor arguments
//! - The dispatcher driving each delivery to a single settlement, and the
//!   per-queue consumer loop feeding it
//! - An RPC client for the request/reply pattern

extern crate self as warren_framework;

pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod extractor;
pub mod handler;
pub mod interceptor;
pub mod pipe;
pub mod registry;
pub mod route;
pub mod router;
pub mod rpc;
pub mod wire;

#[doc(hidden)]
pub use linkme;

pub use consumer::{ConsumerOptions, QueueConsumer, Subscription};
pub use dispatcher::{
    DispatchError, DispatchOptions, DispatchOutcome, DispatchStats, Dispatcher, MessageState,
    StatsSnapshot,
};
pub use error::{ExtractError, ExtractResult, RegistrationError, RegistrationResult};
pub use extractor::{CorrelationId, FromContext, MessageHeaders, Metadata, Payload, RoutingKey};
pub use handler::{BoxedHandler, ErasedHandler, Handler, HandlerFn, IntoReply, Json, into_handler};
pub use interceptor::{
    BoxedInterceptor, Interceptor, InterceptorChain, MapErr, Next, Retry, Timing,
};
pub use pipe::{
    BoxedPipe, FnPipe, PayloadSchema, Pipe, PipeChain, PipeFailure, SchemaPipe, Validate, pipe_fn,
};
pub use registry::{CONTROLLERS, HandlerEntry, Registry, RegistryBuilder, RouteBinding};
pub use route::{Controller, HandlerRef, ReplyContract, Route};
pub use router::Router;
pub use rpc::{RpcClient, RpcError, RpcResult};
pub use wire::RemoteError;

/// Prelude for common imports.
pub mod prelude {
    pub use super::extractor::{CorrelationId, MessageHeaders, Metadata, Payload, RoutingKey};
    pub use super::handler::Json;
    pub use super::interceptor::{Interceptor, Next};
    pub use super::pipe::{PayloadSchema, Pipe, Validate, pipe_fn};
    pub use super::route::{Controller, Route};
    pub use warren_core::prelude::*;
}
