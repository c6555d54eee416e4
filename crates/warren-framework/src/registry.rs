//! Metadata registry.
//!
//! The registry turns [`Controller`] declarations into immutable
//! [`HandlerEntry`] values, rejecting duplicate and ambiguous bindings. It is
//! built once, single-threaded, before any message is consumed, and is then
//! shared read-only behind an `Arc`.
//!
//! Controllers come from explicit [`RegistryBuilder::register`] calls or from
//! [`RegistryBuilder::scan`], which collects every factory annotated with
//! `#[controller]` through a link-time distributed slice.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use linkme::distributed_slice;
use tracing::{debug, info};
use warren_core::{ExecutionContext, HandlerResult, RouteNotFound, TopicPattern};

use crate::error::{RegistrationError, RegistrationResult};
use crate::handler::BoxedHandler;
use crate::interceptor::InterceptorChain;
use crate::pipe::{BoxedPipe, PayloadSchema, PipeChain, SchemaPipe};
use crate::route::{Controller, HandlerRef, ReplyContract};
use crate::router::Router;

/// Controller factories contributed by `#[controller]`.
#[distributed_slice]
pub static CONTROLLERS: [fn() -> Controller];

/// Where a handler listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    pub queue: String,
    /// Exchange the queue is bound to with `pattern`; `None` means the
    /// queue only receives messages published to it directly.
    pub exchange: Option<String>,
    pub pattern: TopicPattern,
    pub handler: HandlerRef,
}

/// Everything needed to run one handler.
pub struct HandlerEntry {
    binding: RouteBinding,
    pipes: PipeChain,
    interceptors: InterceptorChain,
    schema: Option<PayloadSchema>,
    reply: ReplyContract,
    handler: BoxedHandler,
}

impl HandlerEntry {
    pub fn binding(&self) -> &RouteBinding {
        &self.binding
    }

    pub fn handler_ref(&self) -> &HandlerRef {
        &self.binding.handler
    }

    /// The pipe chain, schema pipe first when a schema is declared.
    pub fn pipes(&self) -> &PipeChain {
        &self.pipes
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    pub fn schema(&self) -> Option<&PayloadSchema> {
        self.schema.as_ref()
    }

    pub fn reply_contract(&self) -> ReplyContract {
        self.reply
    }

    /// Runs the interceptor chain around the handler.
    pub async fn invoke(&self, ctx: &mut ExecutionContext) -> HandlerResult {
        self.interceptors.run(ctx, self.handler.as_ref()).await
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("binding", &self.binding)
            .field("pipes", &self.pipes)
            .field("interceptors", &self.interceptors)
            .field("schema", &self.schema)
            .field("reply", &self.reply)
            .finish()
    }
}

/// Collects controllers and validates their bindings.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<HandlerEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every route of `controller`.
    ///
    /// Either all routes of the controller are accepted or none are.
    pub fn register(&mut self, controller: Controller) -> RegistrationResult<&mut Self> {
        let Controller {
            name,
            queue: default_queue,
            exchange: default_exchange,
            pipes: controller_pipes,
            interceptors: controller_interceptors,
            routes,
        } = controller;

        let mut pending: Vec<HandlerEntry> = Vec::with_capacity(routes.len());

        for route in routes {
            let handler = HandlerRef::new(name.clone(), route.method);

            let queue = route
                .queue
                .or_else(|| default_queue.clone())
                .ok_or_else(|| RegistrationError::MissingQueue {
                    handler: handler.to_string(),
                })?;

            let pattern = TopicPattern::parse(&route.pattern).map_err(|source| {
                RegistrationError::InvalidPattern {
                    handler: handler.to_string(),
                    source,
                }
            })?;

            let binding = RouteBinding {
                queue,
                exchange: route.exchange.or_else(|| default_exchange.clone()),
                pattern,
                handler,
            };

            for existing in self.entries.iter().chain(pending.iter()) {
                check_conflict(existing.binding(), &binding)?;
            }

            let mut pipes: Vec<BoxedPipe> = Vec::new();
            if let Some(schema) = &route.schema {
                pipes.push(Arc::new(SchemaPipe::new(schema.clone())));
            }
            pipes.extend(controller_pipes.iter().cloned());
            pipes.extend(route.pipes);

            let mut interceptors = controller_interceptors.clone();
            interceptors.extend(route.interceptors);

            debug!(
                handler = %binding.handler,
                queue = %binding.queue,
                pattern = %binding.pattern,
                "Registered route"
            );

            pending.push(HandlerEntry {
                binding,
                pipes: PipeChain::new(pipes),
                interceptors: InterceptorChain::new(interceptors),
                schema: route.schema,
                reply: route.reply,
                handler: route.handler,
            });
        }

        self.entries.extend(pending);
        Ok(self)
    }

    /// Registers every controller contributed through `#[controller]`.
    ///
    /// Controllers are registered in name order so conflicts are reported
    /// deterministically regardless of link order.
    pub fn scan(&mut self) -> RegistrationResult<&mut Self> {
        let mut controllers: Vec<Controller> = CONTROLLERS.iter().map(|factory| factory()).collect();
        controllers.sort_by(|a, b| a.name.cmp(&b.name));
        for controller in controllers {
            self.register(controller)?;
        }
        Ok(self)
    }

    /// Freezes the registry.
    pub fn build(self) -> Registry {
        let entries: Vec<Arc<HandlerEntry>> = self.entries.into_iter().map(Arc::new).collect();
        let by_handler = entries
            .iter()
            .map(|e| (e.handler_ref().clone(), Arc::clone(e)))
            .collect();
        let router = Router::new(entries.iter().cloned());

        info!(
            routes = entries.len(),
            queues = router.queues().count(),
            "Registry built"
        );

        Registry {
            entries,
            by_handler,
            router,
        }
    }
}

fn check_conflict(existing: &RouteBinding, new: &RouteBinding) -> RegistrationResult<()> {
    if existing.handler == new.handler {
        return Err(RegistrationError::DuplicateHandler {
            handler: new.handler.to_string(),
        });
    }
    if existing.queue != new.queue {
        return Ok(());
    }
    if existing.pattern == new.pattern {
        return Err(RegistrationError::DuplicateBinding {
            queue: new.queue.clone(),
            pattern: new.pattern.to_string(),
            existing: existing.handler.to_string(),
            duplicate: new.handler.to_string(),
        });
    }
    if existing.pattern.wildcard_count() == new.pattern.wildcard_count()
        && existing.pattern.overlaps(&new.pattern)
    {
        return Err(RegistrationError::AmbiguousBinding {
            queue: new.queue.clone(),
            first: existing.pattern.to_string(),
            first_handler: existing.handler.to_string(),
            second: new.pattern.to_string(),
            second_handler: new.handler.to_string(),
        });
    }
    Ok(())
}

/// The frozen set of handler entries.
pub struct Registry {
    entries: Vec<Arc<HandlerEntry>>,
    by_handler: HashMap<HandlerRef, Arc<HandlerEntry>>,
    router: Router,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Finds the handler for a delivery.
    pub fn lookup(&self, queue: &str, routing_key: &str) -> Option<Arc<HandlerEntry>> {
        self.router.lookup(queue, routing_key)
    }

    pub fn resolve(&self, queue: &str, routing_key: &str) -> Result<Arc<HandlerEntry>, RouteNotFound> {
        self.router.resolve(queue, routing_key)
    }

    pub fn entry(&self, handler: &HandlerRef) -> Option<&Arc<HandlerEntry>> {
        self.by_handler.get(handler)
    }

    pub fn entries(&self) -> &[Arc<HandlerEntry>] {
        &self.entries
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Distinct queues with at least one route, sorted.
    pub fn queues(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.binding().queue.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries.len())
            .field("queues", &self.queues())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;

    async fn noop() {}

    fn controller(name: &str, patterns: &[&str]) -> Controller {
        patterns.iter().enumerate().fold(
            Controller::new(name).queue("orders"),
            |c, (i, p)| c.route(Route::new(*p, noop).name(format!("m{i}"))),
        )
    }

    #[test]
    fn test_lookup_returns_unique_match() {
        let mut builder = Registry::builder();
        builder
            .register(controller("Orders", &["orders.*.created", "orders.*.deleted"]))
            .unwrap();
        let registry = builder.build();

        let entry = registry.lookup("orders", "orders.eu.created").unwrap();
        assert_eq!(entry.handler_ref().to_string(), "Orders::m0");
        let entry = registry.lookup("orders", "orders.eu.deleted").unwrap();
        assert_eq!(entry.handler_ref().to_string(), "Orders::m1");
        assert!(registry.lookup("orders", "orders.eu.updated").is_none());
        assert!(registry.lookup("other", "orders.eu.created").is_none());
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let mut builder = Registry::builder();
        builder.register(controller("A", &["orders.#"])).unwrap();
        let err = builder.register(controller("B", &["orders.#"])).err().unwrap();
        assert!(matches!(err, RegistrationError::DuplicateBinding { .. }));
    }

    #[test]
    fn test_equal_specificity_overlap_rejected() {
        let mut builder = Registry::builder();
        let err = builder
            .register(controller("A", &["orders.*.created", "orders.eu.*"]))
            .err()
            .unwrap();
        assert!(matches!(err, RegistrationError::AmbiguousBinding { .. }));
        // nothing from the failed controller was kept
        assert!(builder.build().is_empty());
    }

    #[test]
    fn test_different_specificity_overlap_allowed() {
        let mut builder = Registry::builder();
        builder
            .register(controller("A", &["orders.eu.created", "orders.*.created", "orders.#.#"]))
            .unwrap();
        assert_eq!(builder.build().len(), 3);
    }

    #[test]
    fn test_same_pattern_on_other_queue_allowed() {
        let mut builder = Registry::builder();
        builder.register(controller("A", &["orders.#"])).unwrap();
        builder
            .register(Controller::new("B").queue("audit").route(Route::new("orders.#", noop)))
            .unwrap();
        assert_eq!(builder.build().queues().len(), 2);
    }

    #[test]
    fn test_missing_queue() {
        let mut builder = Registry::builder();
        let err = builder
            .register(Controller::new("A").route(Route::new("x", noop)))
            .err()
            .unwrap();
        assert!(matches!(err, RegistrationError::MissingQueue { .. }));
    }

    #[test]
    fn test_controller_defaults_apply() {
        let mut builder = Registry::builder();
        builder
            .register(
                Controller::new("Orders")
                    .queue("orders")
                    .exchange("events")
                    .route(Route::new("orders.#", noop))
                    .route(Route::new("special", noop).name("special").queue("vip").exchange("direct")),
            )
            .unwrap();
        let registry = builder.build();

        let entry = registry.entry(&HandlerRef::new("Orders", "noop")).unwrap();
        assert_eq!(entry.binding().queue, "orders");
        assert_eq!(entry.binding().exchange.as_deref(), Some("events"));

        let entry = registry.entry(&HandlerRef::new("Orders", "special")).unwrap();
        assert_eq!(entry.binding().queue, "vip");
        assert_eq!(entry.binding().exchange.as_deref(), Some("direct"));
    }

    #[test]
    fn test_schema_pipe_runs_first() {
        let mut builder = Registry::builder();
        builder
            .register(
                Controller::new("Orders")
                    .queue("orders")
                    .pipe(crate::pipe::pipe_fn("controller", |v, _| Ok(v)))
                    .route(
                        Route::new("orders.#", noop)
                            .schema(PayloadSchema::of::<serde_json::Value>())
                            .pipe(crate::pipe::pipe_fn("route", |v, _| Ok(v))),
                    ),
            )
            .unwrap();
        let registry = builder.build();
        let entry = registry.lookup("orders", "orders.x").unwrap();
        let names: Vec<&str> = entry.pipes().names().collect();
        assert_eq!(names, ["schema", "controller", "route"]);
    }
}
