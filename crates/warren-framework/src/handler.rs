//! Handler system for the Warren framework.
//!
//! Handlers are plain async functions. The [`Handler`] trait is implemented
//! for every function whose parameters implement [`FromContext`] and whose
//! return type implements [`IntoReply`], the same blanket-impl approach Axum
//! uses.
//!
//! # Example
//!
//! ```rust,ignore
//! // Fire-and-forget consumer
//! async fn audit(Payload(event): Payload<AuditEvent>) {
//!     store(event);
//! }
//!
//! // RPC handler with a typed reply
//! async fn echo(Payload(req): Payload<EchoRequest>) -> Json<EchoReply> {
//!     Json(EchoReply { v: req.v * 2 })
//! }
//!
//! // Fallible handler
//! async fn charge(Payload(order): Payload<Order>, key: RoutingKey) -> Result<(), HandlerError> {
//!     billing::charge(&order).await.map_err(HandlerError::transient)
//! }
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use warren_core::{ExecutionContext, HandlerError, HandlerResult, Reply};

use crate::extractor::FromContext;

// ============================================================================
// IntoReply - Convert handler return values
// ============================================================================

/// Types a handler may return.
pub trait IntoReply: Send + 'static {
    fn into_reply(self) -> HandlerResult;
}

/// No reply body.
impl IntoReply for () {
    fn into_reply(self) -> HandlerResult {
        Ok(None)
    }
}

impl IntoReply for Reply {
    fn into_reply(self) -> HandlerResult {
        Ok(Some(self))
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> HandlerResult {
        Ok(Some(Reply::new(self)))
    }
}

impl IntoReply for HandlerError {
    fn into_reply(self) -> HandlerResult {
        Err(self)
    }
}

/// On `None`, the handler succeeds without a reply body.
impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> HandlerResult {
        match self {
            Some(t) => t.into_reply(),
            None => Ok(None),
        }
    }
}

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: Into<HandlerError> + Send + 'static,
{
    fn into_reply(self) -> HandlerResult {
        match self {
            Ok(t) => t.into_reply(),
            Err(e) => Err(e.into()),
        }
    }
}

/// A reply serialized as JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize + Send + 'static> IntoReply for Json<T> {
    fn into_reply(self) -> HandlerResult {
        Reply::json(&self.0).map(Some)
    }
}

// ============================================================================
// Handler Trait
// ============================================================================

/// The core trait for message handlers.
///
/// Arguments are extracted synchronously from the context; the returned
/// future owns everything it needs, so the context stays available to the
/// interceptors wrapping the call.
pub trait Handler<T>: Clone + Send + Sync + 'static {
    /// The type of future calling this handler returns.
    type Future: Future<Output = HandlerResult> + Send + 'static;

    fn call(self, ctx: &ExecutionContext) -> Self::Future;
}

/// A wrapper that turns a [`Handler`] into an [`ErasedHandler`].
pub struct HandlerFn<F, T> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> HandlerFn<F, T> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<F: Clone, T> Clone for HandlerFn<F, T> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            _marker: PhantomData,
        }
    }
}

/// Type-erased handler trait for dynamic dispatch.
pub trait ErasedHandler: Send + Sync {
    fn call(&self, ctx: &ExecutionContext) -> BoxFuture<'static, HandlerResult>;
}

impl<F, T> ErasedHandler for HandlerFn<F, T>
where
    F: Handler<T>,
    T: 'static,
{
    fn call(&self, ctx: &ExecutionContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self.f.clone().call(ctx))
    }
}

/// A type-erased handler stored in a [`HandlerEntry`](crate::registry::HandlerEntry).
pub type BoxedHandler = Arc<dyn ErasedHandler>;

/// Converts a handler function into a [`BoxedHandler`].
pub fn into_handler<F, T>(f: F) -> BoxedHandler
where
    F: Handler<T>,
    T: 'static,
{
    Arc::new(HandlerFn::new(f))
}

// ============================================================================
// Handler implementations for functions
// ============================================================================

macro_rules! impl_handler {
    (
        $($ty:ident),*
    ) => {
        #[allow(non_snake_case, unused_variables)]
        impl<F, Fut, Res, $($ty,)*> Handler<($($ty,)*)> for F
        where
            F: FnOnce($($ty,)*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            Res: IntoReply,
            $( $ty: FromContext + Send + 'static, )*
        {
            type Future = BoxFuture<'static, HandlerResult>;

            fn call(self, ctx: &ExecutionContext) -> Self::Future {
                $(
                    let $ty = match $ty::from_context(ctx) {
                        Ok(value) => value,
                        Err(err) => {
                            let err = HandlerError::from(err);
                            return Box::pin(async move { Err(err) });
                        }
                    };
                )*

                Box::pin(async move { (self)($($ty,)*).await.into_reply() })
            }
        }
    };
}

impl_handler!();
impl_handler!(T1);
impl_handler!(T1, T2);
impl_handler!(T1, T2, T3);
impl_handler!(T1, T2, T3, T4);
impl_handler!(T1, T2, T3, T4, T5);
impl_handler!(T1, T2, T3, T4, T5, T6);
impl_handler!(T1, T2, T3, T4, T5, T6, T7);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8, T9);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12);
