//! # Warren
//!
//! Declarative, type-safe AMQP message routing for Rust services.
//!
//! ## Overview
//!
//! Warren binds (queue, routing pattern) pairs to async handlers. Every
//! delivery is resolved to exactly one handler, run through its pipes and
//! interceptors, optionally answered on `reply_to`, and settled exactly once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌────────────┐     ┌──────────┐     ┌───────┐     ┌──────────────┐     ┌─────────┐
//! │   Runtime   │────▶│  Consumer  │────▶│Dispatcher│────▶│ Router│────▶│ Pipes        │────▶│ Handler │
//! │ (sessions)  │     │ (per queue)│     │          │     └───────┘     │ Interceptors │     └─────────┘
//! └─────────────┘     └────────────┘     └──────────┘                   └──────────────┘
//! ```
//!
//! - **Runtime**: loads configuration, declares topology, supervises broker sessions
//! - **Consumers**: one per queue, bounded concurrency, graceful drain
//! - **Dispatcher**: owns the ack/nack decision and the reply
//! - **Controllers**: group routes sharing a queue, exchange, pipes and interceptors
//! - **Handlers**: async functions with extractor arguments (Axum-style)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use warren::prelude::*;
//!
//! #[derive(Deserialize, Serialize)]
//! struct Echo { v: i64 }
//!
//! async fn double(Payload(echo): Payload<Echo>) -> Json<Echo> {
//!     Json(Echo { v: echo.v * 2 })
//! }
//!
//! #[controller]
//! fn echo() -> Controller {
//!     Controller::new("Echo")
//!         .queue("rpc.echo")
//!         .exchange("rpc")
//!         .route(Route::new("rpc.echo", double))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     WarrenRuntime::builder().build()?.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! `#[controller]` expands to paths under `warren_framework`, so crates using
//! it depend on `warren-framework` directly as well.
//!
//! ## Features
//!
//! - `toml-config`: TOML configuration files (default)
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output
//! - `amqp`: RabbitMQ gateway built on lapin

pub use warren_core as core;
pub use warren_framework as framework;
pub use warren_runtime as runtime;
pub use warren_transport as transport;

pub use warren_macros::controller;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use warren::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use warren_runtime::{RuntimeStats, WarrenRuntime};

    // Declaring routes
    pub use warren_framework::{Controller, Route};
    pub use warren_macros::controller;

    // Handlers and extractors
    pub use warren_framework::extractor::{
        CorrelationId, FromContext, MessageHeaders, Metadata, Payload, RoutingKey,
    };
    pub use warren_framework::handler::Json;

    // Pipes and interceptors
    pub use warren_framework::interceptor::{Interceptor, MapErr, Next, Retry, Timing};
    pub use warren_framework::pipe::{PayloadSchema, Pipe, SchemaPipe, Validate, pipe_fn};

    // Calling other services
    pub use warren_framework::{RemoteError, RpcClient, RpcError};

    // Core types
    pub use warren_core::prelude::*;

    pub use serde::{Deserialize, Serialize};
}
