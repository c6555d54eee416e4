//! Derives the broker topology from registered routes and configuration.

use warren_core::{BindingSpec, ExchangeSpec, Topology};
use warren_framework::Registry;

use crate::config::{QueueConfig, WarrenConfig};

/// Builds everything to declare on connect.
///
/// Configured exchanges come first so their kind and flags win over the
/// topic exchanges implied by routes. Every queue a route listens on is
/// declared, using its `queues.<name>` section when present, and bound to the
/// route's exchange with the route pattern. Queues that only appear in
/// configuration are declared with their explicit bindings.
pub fn plan_topology(registry: &Registry, config: &WarrenConfig) -> Topology {
    let mut topology = Topology::new();
    let default_dlx = config.broker.dead_letter_exchange.as_deref();
    let fallback = QueueConfig::default();

    for (name, exchange) in &config.exchanges {
        topology.add_exchange(exchange.to_spec(name));
    }

    for entry in registry.entries() {
        let binding = entry.binding();
        let queue = config.queues.get(&binding.queue).unwrap_or(&fallback);
        topology.add_queue(queue.to_spec(&binding.queue, default_dlx));

        if let Some(exchange) = &binding.exchange {
            topology.add_exchange(ExchangeSpec::topic(exchange.clone()));
            topology.add_binding(BindingSpec::new(
                binding.queue.clone(),
                exchange.clone(),
                binding.pattern.as_str(),
            ));
        }
    }

    for (name, queue) in &config.queues {
        topology.add_queue(queue.to_spec(name, default_dlx));
        for binding in &queue.bindings {
            topology.add_exchange(ExchangeSpec::topic(binding.exchange.clone()));
            topology.add_binding(BindingSpec::new(
                name.clone(),
                binding.exchange.clone(),
                binding.routing_key.clone(),
            ));
        }
    }

    let dead_letter: Vec<String> = topology
        .queues
        .iter()
        .filter_map(|q| q.dead_letter_exchange.clone())
        .collect();
    for exchange in dead_letter {
        topology.add_exchange(ExchangeSpec::topic(exchange));
    }

    topology
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BindingConfig, ExchangeConfig};
    use warren_core::ExchangeKind;
    use warren_framework::{Controller, Route};

    async fn ok() {}

    fn registry() -> Registry {
        let mut builder = Registry::builder();
        builder
            .register(
                Controller::new("Orders")
                    .queue("orders")
                    .exchange("events")
                    .route(Route::new("order.created", ok).name("created"))
                    .route(Route::new("order.*.cancelled", ok).name("cancelled")),
            )
            .unwrap()
            .register(
                Controller::new("Direct")
                    .queue("direct.jobs")
                    .route(Route::new("#", ok)),
            )
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_routes_imply_queues_exchanges_and_bindings() {
        let topology = plan_topology(&registry(), &WarrenConfig::default());

        let queues: Vec<_> = topology.queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(queues.len(), 2);
        assert!(queues.contains(&"orders") && queues.contains(&"direct.jobs"));
        assert_eq!(topology.exchanges, vec![ExchangeSpec::topic("events")]);
        assert_eq!(topology.bindings.len(), 2);
        assert!(
            topology
                .bindings
                .contains(&BindingSpec::new("orders", "events", "order.*.cancelled"))
        );
    }

    #[test]
    fn test_config_overrides_and_dead_lettering() {
        let mut config = WarrenConfig::default();
        config.broker.dead_letter_exchange = Some("dlx".into());
        config.exchanges.insert(
            "events".into(),
            ExchangeConfig {
                kind: ExchangeKind::Direct,
                ..Default::default()
            },
        );
        config.queues.insert(
            "audit".into(),
            QueueConfig {
                bindings: vec![BindingConfig {
                    exchange: "events".into(),
                    routing_key: "#".into(),
                }],
                ..Default::default()
            },
        );
        config.queues.insert(
            "orders".into(),
            QueueConfig {
                durable: false,
                ..Default::default()
            },
        );

        let topology = plan_topology(&registry(), &config);

        let events = topology.exchanges.iter().find(|e| e.name == "events").unwrap();
        assert_eq!(events.kind, ExchangeKind::Direct);
        assert!(topology.exchanges.iter().any(|e| e.name == "dlx"));

        let orders = topology.queues.iter().find(|q| q.name == "orders").unwrap();
        assert!(!orders.durable);
        assert_eq!(orders.dead_letter_exchange.as_deref(), Some("dlx"));
        assert!(topology.queues.iter().any(|q| q.name == "audit"));
        assert!(
            topology
                .bindings
                .contains(&BindingSpec::new("audit", "events", "#"))
        );
    }
}
