//! Procedural macros for the Warren routing framework.
//!
//! This crate provides:
//!
//! - `#[controller]` - Registers a controller factory for registry scanning
//!
//! # Handlers
//!
//! Handlers need no macro. Any async function whose arguments implement
//! `FromContext` can be attached to a route, similar to Axum's approach.
//!
//! ```rust,ignore
//! use warren::prelude::*;
//!
//! async fn echo(Payload(body): Payload<serde_json::Value>) -> Json<serde_json::Value> {
//!     Json(body)
//! }
//!
//! #[controller]
//! fn echo_controller() -> Controller {
//!     Controller::new("Echo")
//!         .queue("rpc.echo")
//!         .route(Route::new("rpc.echo", echo))
//! }
//! ```

mod controller;

use proc_macro::TokenStream;

/// Registers a controller factory.
///
/// The decorated function must be a plain, synchronous, argument-less
/// `fn() -> Controller`. It is left unchanged; the macro appends a
/// distributed-slice entry so that `RegistryBuilder::scan` picks it up.
#[proc_macro_attribute]
pub fn controller(attr: TokenStream, item: TokenStream) -> TokenStream {
    controller::controller(attr, item)
}
