//! Runtime orchestration: supervised broker sessions with reconnect.
//!
//! A session is one broker connection. It declares the topology, starts one
//! [`QueueConsumer`] per routed queue and lasts until shutdown or until a
//! consumer reports a [`GatewayError`]. The supervisor then closes the
//! connection and reconnects with exponential backoff.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use warren_runtime::WarrenRuntime;
//!
//! let runtime = WarrenRuntime::builder()
//!     .config_file("config/warren.toml")
//!     .controller(orders_controller())
//!     .build()?;
//!
//! // Runs until Ctrl+C or SIGTERM
//! runtime.run().await?;
//! ```

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warren_core::{BoxedGateway, Connector, GatewayError};
use warren_framework::{
    ConsumerOptions, Controller, DispatchOptions, DispatchStats, Dispatcher, QueueConsumer,
    Registry, RpcClient, StatsSnapshot,
};
use warren_transport::{MemoryBroker, MemoryConnector};

use crate::config::{BrokerConfig, ConfigLoader, WarrenConfig, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;
use crate::topology::plan_topology;

/// Point-in-time view of the runtime's health and message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Whether a broker session is currently open.
    pub connected: bool,
    /// Sessions opened since start.
    pub sessions: u64,
    /// Connection attempts after the first one.
    pub reconnects: u64,
    /// Totals across all sessions.
    pub messages: StatsSnapshot,
}

#[derive(Debug, Default)]
struct Health {
    connected: AtomicBool,
    sessions: AtomicU64,
    reconnects: AtomicU64,
}

/// How a session ended.
enum SessionEnd {
    /// Shutdown was requested.
    Shutdown,
    /// Failed before consumers were running.
    Failed(GatewayError),
    /// Consumers were running and the connection broke.
    Lost(GatewayError),
}

/// The warren service runtime.
///
/// Owns the configuration, the immutable [`Registry`] and the [`Connector`].
/// Message counters survive reconnects.
pub struct WarrenRuntime {
    config: WarrenConfig,
    registry: Arc<Registry>,
    connector: Arc<dyn Connector>,
    stats: Arc<DispatchStats>,
    health: Arc<Health>,
    running: AtomicBool,
}

impl WarrenRuntime {
    /// Creates a runtime builder.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let runtime = WarrenRuntime::builder()
    ///     .profile("production")
    ///     .build()?;
    /// ```
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from an already loaded configuration, scanning
    /// `#[controller]` factories.
    pub fn from_config(config: WarrenConfig) -> RuntimeResult<Self> {
        RuntimeBuilder::new().config(config).build()
    }

    pub fn config(&self) -> &WarrenConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            connected: self.health.connected.load(Ordering::SeqCst),
            sessions: self.health.sessions.load(Ordering::Relaxed),
            reconnects: self.health.reconnects.load(Ordering::Relaxed),
            messages: self.stats.snapshot(),
        }
    }

    /// Opens a separate connection and starts an [`RpcClient`] on it, using
    /// `rpc.timeout` as the default reply timeout.
    pub async fn rpc_client(&self) -> RuntimeResult<RpcClient> {
        let gateway = self.connector.connect().await?;
        Ok(RpcClient::start(gateway, self.config.rpc.timeout).await?)
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        let signal = shutdown_signal()?;
        info!("Warren runtime is now running. Press Ctrl+C to stop.");
        self.run_until(signal).await
    }

    /// Runs until `shutdown` completes, then drains in-flight messages.
    ///
    /// Returns an error only when the broker stayed unreachable for
    /// `broker.reconnect.max_retries` consecutive attempts.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let token = CancellationToken::new();
        let supervisor = self.supervise(token.clone());
        tokio::pin!(supervisor);

        let result = tokio::select! {
            result = &mut supervisor => result,
            _ = shutdown => {
                info!("Shutdown requested");
                token.cancel();
                supervisor.await
            }
        };
        info!("Runtime stopped");
        result
    }

    async fn supervise(&self, shutdown: CancellationToken) -> RuntimeResult<()> {
        let retry = &self.config.broker.reconnect;
        let target = self.connector.describe();
        let mut failures: u32 = 0;
        let mut delay = retry.initial_delay;

        loop {
            let connected = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                connected = self.connector.connect() => connected,
            };

            let error = match connected {
                Ok(gateway) => {
                    let session = self.health.sessions.fetch_add(1, Ordering::Relaxed) + 1;
                    self.health.connected.store(true, Ordering::SeqCst);
                    info!(broker = %target, session, "Connected to broker");

                    let end = self.session(gateway.clone(), &shutdown).await;

                    self.health.connected.store(false, Ordering::SeqCst);
                    if let Err(e) = gateway.close().await {
                        debug!(error = %e, "Error closing broker connection");
                    }

                    match end {
                        SessionEnd::Shutdown => return Ok(()),
                        SessionEnd::Failed(e) => e,
                        SessionEnd::Lost(e) => {
                            failures = 0;
                            delay = retry.initial_delay;
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            failures += 1;
            if !retry.allows(failures) {
                error!(broker = %target, attempts = failures, error = %error, "Giving up on broker");
                return Err(RuntimeError::ReconnectExhausted {
                    attempts: failures,
                    source: error,
                });
            }

            warn!(
                broker = %target,
                attempt = failures,
                delay = ?delay,
                error = %error,
                "Broker unavailable, reconnecting"
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = retry.next_delay(delay);
            self.health.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn session(&self, gateway: BoxedGateway, shutdown: &CancellationToken) -> SessionEnd {
        if self.config.broker.auto_declare {
            let topology = plan_topology(&self.registry, &self.config);
            if let Err(e) = topology.apply(gateway.as_ref()).await {
                error!(error = %e, "Failed to declare topology");
                return SessionEnd::Failed(e);
            }
            debug!(
                exchanges = topology.exchanges.len(),
                queues = topology.queues.len(),
                bindings = topology.bindings.len(),
                "Topology declared"
            );
        }

        let dispatcher = Dispatcher::with_stats(
            Arc::clone(&self.registry),
            gateway.clone(),
            DispatchOptions {
                service_name: self.config.service_name.clone(),
                log_messages: self.config.consumer.log_messages,
            },
            Arc::clone(&self.stats),
        );

        let mut subscriptions = Vec::new();
        for queue in self.registry.queues() {
            let consumer = QueueConsumer::new(
                queue,
                gateway.clone(),
                dispatcher.clone(),
                self.consumer_options(queue),
            );
            match consumer.subscribe().await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    error!(queue, error = %e, "Failed to subscribe");
                    return SessionEnd::Failed(e);
                }
            }
        }

        if subscriptions.is_empty() {
            warn!("No routes registered, idling until shutdown");
            shutdown.cancelled().await;
            return SessionEnd::Shutdown;
        }

        let session = shutdown.child_token();
        let mut consumers = JoinSet::new();
        for subscription in subscriptions {
            consumers.spawn(subscription.run(session.clone()));
        }

        let mut failure = None;
        while let Some(joined) = consumers.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(GatewayError::channel(format!("consumer task failed: {e}")))
            });
            if let Err(e) = result
                && failure.is_none()
            {
                error!(error = %e, "Consumer stopped, ending session");
                session.cancel();
                failure = Some(e);
            }
        }

        match failure {
            Some(e) => SessionEnd::Lost(e),
            None => SessionEnd::Shutdown,
        }
    }

    fn consumer_options(&self, queue: &str) -> ConsumerOptions {
        let defaults = &self.config.consumer;
        let overrides = self.config.queues.get(queue);
        ConsumerOptions {
            prefetch: overrides
                .and_then(|q| q.prefetch)
                .unwrap_or(defaults.prefetch),
            concurrency: overrides
                .and_then(|q| q.concurrency)
                .unwrap_or(defaults.concurrency),
            drain_timeout: defaults.shutdown_timeout,
        }
    }
}

impl std::fmt::Debug for WarrenRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarrenRuntime")
            .field("service_name", &self.config.service_name)
            .field("broker", &self.connector.describe())
            .field("routes", &self.registry.len())
            .field("stats", &self.stats())
            .finish()
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Resolves once Ctrl+C or SIGTERM is received.
fn shutdown_signal() -> RuntimeResult<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(RuntimeError::Signal)?;

    Ok(async move {
        #[cfg(unix)]
        tokio::select! {
            result = signal::ctrl_c() => on_ctrl_c(result),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }

        #[cfg(not(unix))]
        on_ctrl_c(signal::ctrl_c().await);
    })
}

fn on_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }
}

/// Picks a connector from the broker URL scheme.
fn connector_for(broker: &BrokerConfig) -> RuntimeResult<Arc<dyn Connector>> {
    if broker.url.starts_with("memory://") {
        return Ok(Arc::new(MemoryConnector::new(MemoryBroker::new())));
    }

    #[cfg(feature = "amqp")]
    if broker.url.starts_with("amqp://") || broker.url.starts_with("amqps://") {
        let mut connector = warren_transport::AmqpConnector::new(broker.url.clone());
        if let Some(name) = &broker.connection_name {
            connector = connector.with_connection_name(name.clone());
        }
        return Ok(Arc::new(connector));
    }

    Err(RuntimeError::UnsupportedBroker(broker.url.clone()))
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`WarrenRuntime`].
///
/// Configuration is loaded through [`ConfigLoader`] unless a complete
/// [`WarrenConfig`] is supplied. Controllers registered explicitly are added
/// after the `#[controller]` scan.
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    config: Option<WarrenConfig>,
    controllers: Vec<Controller>,
    scan: bool,
    connector: Option<Arc<dyn Connector>>,
    init_logging: bool,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            config: None,
            controllers: Vec::new(),
            scan: true,
            connector: None,
            init_logging: true,
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g., "development", "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges additional configuration over the loaded sources.
    pub fn merge(mut self, config: WarrenConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Overrides a single value by dotted key, e.g. `("broker.url", "memory://")`.
    pub fn set<T: Serialize>(mut self, key: &str, value: T) -> Self {
        self.config_loader = self.config_loader.set(key, value);
        self
    }

    /// Uses `config` as is instead of loading one.
    pub fn config(mut self, config: WarrenConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn controller(mut self, controller: Controller) -> Self {
        self.controllers.push(controller);
        self
    }

    /// Whether to register `#[controller]` factories (default: true).
    pub fn scan(mut self, enabled: bool) -> Self {
        self.scan = enabled;
        self
    }

    /// Overrides the connector chosen from `broker.url`.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Leaves the global tracing subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    pub fn build(self) -> RuntimeResult<WarrenRuntime> {
        let config = match self.config {
            Some(config) => {
                validate_config(&config)?;
                config
            }
            None => self.config_loader.load()?,
        };

        if self.init_logging {
            logging::init_from_config(&config.logging);
        }

        let mut registry = Registry::builder();
        if self.scan {
            registry.scan()?;
        }
        for controller in self.controllers {
            registry.register(controller)?;
        }
        let registry = Arc::new(registry.build());

        let connector = match self.connector {
            Some(connector) => connector,
            None => connector_for(&config.broker)?,
        };

        info!(
            service = %config.service_name,
            broker = %connector.describe(),
            routes = registry.len(),
            queues = registry.queues().len(),
            "Runtime initialized"
        );

        Ok(WarrenRuntime {
            config,
            registry,
            connector,
            stats: Arc::default(),
            health: Arc::default(),
            running: AtomicBool::new(false),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
