//! Route resolution: (queue, routing key) to exactly one handler entry.
//!
//! Per queue, literal patterns sit in a hash map and wildcard patterns in a
//! list sorted by specificity (fewest wildcard segments first). Literal
//! matches always win. Since equal-specificity overlaps are rejected at
//! registration, the first wildcard hit is the unique most specific match.

use std::collections::HashMap;
use std::sync::Arc;

use warren_core::RouteNotFound;

use crate::registry::HandlerEntry;

#[derive(Default)]
struct QueueRoutes {
    exact: HashMap<String, Arc<HandlerEntry>>,
    wildcard: Vec<Arc<HandlerEntry>>,
}

impl QueueRoutes {
    fn find(&self, routing_key: &str) -> Option<&Arc<HandlerEntry>> {
        self.exact.get(routing_key).or_else(|| {
            self.wildcard
                .iter()
                .find(|entry| entry.binding().pattern.matches(routing_key))
        })
    }
}

/// Read-only route table.
#[derive(Default)]
pub struct Router {
    queues: HashMap<String, QueueRoutes>,
}

impl Router {
    pub fn new(entries: impl IntoIterator<Item = Arc<HandlerEntry>>) -> Self {
        let mut queues: HashMap<String, QueueRoutes> = HashMap::new();

        for entry in entries {
            let routes = queues.entry(entry.binding().queue.clone()).or_default();
            let pattern = &entry.binding().pattern;
            if pattern.is_literal() {
                routes.exact.insert(pattern.as_str().to_string(), entry);
            } else {
                routes.wildcard.push(entry);
            }
        }

        for routes in queues.values_mut() {
            // stable: registration order breaks ties between non-overlapping patterns
            routes
                .wildcard
                .sort_by_key(|entry| entry.binding().pattern.wildcard_count());
        }

        Self { queues }
    }

    /// Resolves a delivery to its handler.
    pub fn resolve(&self, queue: &str, routing_key: &str) -> Result<Arc<HandlerEntry>, RouteNotFound> {
        self.lookup(queue, routing_key).ok_or_else(|| RouteNotFound {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    pub fn lookup(&self, queue: &str, routing_key: &str) -> Option<Arc<HandlerEntry>> {
        self.queues.get(queue)?.find(routing_key).cloned()
    }

    /// Queues with at least one route.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use crate::registry::Registry;
    use crate::route::{Controller, Route};

    async fn noop() {}

    fn registry() -> Registry {
        let mut builder = Registry::builder();
        builder
            .register(
                Controller::new("Orders")
                    .queue("orders")
                    .route(Route::new("orders.eu.created", noop).name("exact"))
                    .route(Route::new("orders.*.created", noop).name("star"))
                    .route(Route::new("orders.#", noop).name("hash")),
            )
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_most_specific_match_wins() {
        let registry = registry();
        let router = registry.router();
        let resolve = |key| router.resolve("orders", key).unwrap().handler_ref().method.clone();

        assert_eq!(resolve("orders.eu.created"), "exact");
        assert_eq!(resolve("orders.us.created"), "star");
        assert_eq!(resolve("orders.eu.west.created"), "hash");
        assert_eq!(resolve("orders"), "hash");
    }

    #[test]
    fn test_route_not_found() {
        let registry = registry();
        let err = registry.router().resolve("orders", "invoices.paid").err().unwrap();
        assert_eq!(err.queue, "orders");
        assert_eq!(err.routing_key, "invoices.paid");

        // queue must match exactly
        assert!(registry.router().resolve("orders.x", "orders.eu.created").is_err());
    }
}
