//! Controller and route declarations.
//!
//! A [`Controller`] groups routes that share defaults (queue, exchange, pipes,
//! interceptors). Each [`Route`] binds a topic pattern to a handler.
//!
//! ```rust,ignore
//! fn orders() -> Controller {
//!     Controller::new("Orders")
//!         .queue("orders.billing")
//!         .exchange("orders")
//!         .interceptor(Timing)
//!         .route(Route::new("orders.*.created", on_created).schema(PayloadSchema::of::<Order>()))
//!         .route(Route::new("orders.#", on_any).no_reply())
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use crate::handler::{BoxedHandler, Handler, into_handler};
use crate::interceptor::{BoxedInterceptor, Interceptor};
use crate::pipe::{BoxedPipe, PayloadSchema, Pipe};

/// Identifies a handler: controller name plus method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerRef {
    pub controller: String,
    pub method: String,
}

impl HandlerRef {
    pub fn new(controller: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.controller, self.method)
    }
}

/// Whether a route answers RPC callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyContract {
    /// Publish the handler's result (or an error reply) to `reply_to`.
    #[default]
    Rpc,
    /// Never publish a reply, even when the message carries `reply_to`.
    None,
}

/// A single pattern-to-handler binding.
pub struct Route {
    pub(crate) pattern: String,
    pub(crate) method: String,
    pub(crate) queue: Option<String>,
    pub(crate) exchange: Option<String>,
    pub(crate) pipes: Vec<BoxedPipe>,
    pub(crate) interceptors: Vec<BoxedInterceptor>,
    pub(crate) schema: Option<PayloadSchema>,
    pub(crate) reply: ReplyContract,
    pub(crate) handler: BoxedHandler,
}

impl Route {
    /// Binds `pattern` to `handler`.
    ///
    /// The method name defaults to the handler function's name; closures fall
    /// back to the pattern. Override with [`name`](Self::name).
    pub fn new<F, T>(pattern: impl Into<String>, handler: F) -> Self
    where
        F: Handler<T>,
        T: 'static,
    {
        let pattern = pattern.into();
        Self {
            method: method_name::<F>().unwrap_or_else(|| pattern.clone()),
            pattern,
            queue: None,
            exchange: None,
            pipes: Vec::new(),
            interceptors: Vec::new(),
            schema: None,
            reply: ReplyContract::Rpc,
            handler: into_handler(handler),
        }
    }

    pub fn name(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Overrides the controller's queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Overrides the controller's exchange.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn pipe(mut self, pipe: impl Pipe) -> Self {
        self.pipes.push(Arc::new(pipe));
        self
    }

    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn schema(mut self, schema: PayloadSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.reply = ReplyContract::None;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern)
            .field("method", &self.method)
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("pipes", &self.pipes.len())
            .field("interceptors", &self.interceptors.len())
            .field("schema", &self.schema)
            .field("reply", &self.reply)
            .finish()
    }
}

fn method_name<F>() -> Option<String> {
    let name = std::any::type_name::<F>();
    let last = name.rsplit("::").next()?;
    if last.contains('{') || last.contains('<') {
        return None;
    }
    Some(last.to_string())
}

/// A named group of routes with shared defaults.
///
/// Controller pipes run before route pipes; controller interceptors wrap
/// route interceptors.
pub struct Controller {
    pub(crate) name: String,
    pub(crate) queue: Option<String>,
    pub(crate) exchange: Option<String>,
    pub(crate) pipes: Vec<BoxedPipe>,
    pub(crate) interceptors: Vec<BoxedInterceptor>,
    pub(crate) routes: Vec<Route>,
}

impl Controller {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: None,
            exchange: None,
            pipes: Vec::new(),
            interceptors: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Default queue for routes that do not name one.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Default exchange the controller's queues are bound to.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn pipe(mut self, pipe: impl Pipe) -> Self {
        self.pipes.push(Arc::new(pipe));
        self
    }

    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routes", &self.routes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn created() {}

    #[test]
    fn test_method_name_from_fn_item() {
        let route = Route::new("orders.*.created", created);
        assert_eq!(route.method(), "created");
    }

    #[test]
    fn test_closure_falls_back_to_pattern() {
        let route = Route::new("orders.#", || async {});
        assert_eq!(route.method(), "orders.#");
        assert_eq!(route.name("all").method(), "all");
    }

    #[test]
    fn test_handler_ref_display() {
        assert_eq!(HandlerRef::new("Echo", "echo").to_string(), "Echo::echo");
    }
}
