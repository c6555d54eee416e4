//! Queue consumer loop.
//!
//! One [`QueueConsumer`] runs per declared queue. It acquires an in-flight
//! permit *before* pulling the next delivery, so at most `concurrency`
//! messages are being processed at any time; with a concurrency of one,
//! messages are handled in delivery order.
//!
//! On shutdown intake stops immediately. In-flight invocations get
//! `drain_timeout` to finish; the rest are aborted and, never having been
//! settled, are redelivered by the broker once the connection closes.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warren_core::{BoxedGateway, DeliveryStream, GatewayError, GatewayResult};

use crate::dispatcher::Dispatcher;

/// Consumer settings for one queue.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Unacked deliveries the broker may push ahead of processing.
    pub prefetch: u16,
    /// Maximum concurrent invocations.
    pub concurrency: usize,
    /// How long shutdown waits for in-flight invocations.
    pub drain_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch: 10,
            concurrency: 10,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Pulls deliveries from one queue and dispatches them concurrently.
pub struct QueueConsumer {
    queue: String,
    gateway: BoxedGateway,
    dispatcher: Dispatcher,
    options: ConsumerOptions,
}

impl QueueConsumer {
    pub fn new(
        queue: impl Into<String>,
        gateway: BoxedGateway,
        dispatcher: Dispatcher,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            queue: queue.into(),
            gateway,
            dispatcher,
            options,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Subscribes and consumes until `shutdown` is cancelled or the gateway
    /// fails. See [`Subscription::run`].
    pub async fn run(self, shutdown: CancellationToken) -> GatewayResult<()> {
        self.subscribe().await?.run(shutdown).await
    }

    /// Starts consuming without processing anything yet.
    ///
    /// Fails when the broker refuses the subscription, e.g. because the
    /// queue does not exist.
    pub async fn subscribe(self) -> GatewayResult<Subscription> {
        let deliveries = self
            .gateway
            .consume(&self.queue, self.options.prefetch)
            .await?;
        info!(
            queue = %self.queue,
            prefetch = self.options.prefetch,
            concurrency = self.options.concurrency,
            "Consumer started"
        );
        Ok(Subscription {
            queue: self.queue,
            deliveries,
            dispatcher: self.dispatcher,
            options: self.options,
        })
    }
}

/// An active subscription returned by [`QueueConsumer::subscribe`].
pub struct Subscription {
    queue: String,
    deliveries: DeliveryStream,
    dispatcher: Dispatcher,
    options: ConsumerOptions,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Processes deliveries until `shutdown` is cancelled or the gateway fails.
    ///
    /// Returns `Ok(())` after a requested shutdown and `Err` when the
    /// delivery stream broke or a settlement could not be performed; either
    /// way in-flight work has been drained or aborted first.
    pub async fn run(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let Self {
            queue,
            mut deliveries,
            dispatcher,
            options,
        } = self;

        let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let halt = shutdown.child_token();
        let failure: Arc<Mutex<Option<GatewayError>>> = Arc::default();
        let mut tasks = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(queue = %queue, error = %e, "Dispatch task failed");
                }
            }

            let permit = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    let dispatcher = dispatcher.clone();
                    let halt = halt.clone();
                    let failure = Arc::clone(&failure);
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = dispatcher.dispatch(message).await {
                            failure.lock().get_or_insert(e);
                            halt.cancel();
                        }
                    });
                }
                Some(Err(e)) => {
                    error!(queue = %queue, error = %e, "Delivery stream failed");
                    failure.lock().get_or_insert(e);
                    break;
                }
                None => {
                    warn!(queue = %queue, "Delivery stream ended");
                    failure
                        .lock()
                        .get_or_insert(GatewayError::ConsumerCancelled(queue.clone()));
                    break;
                }
            }
        }

        drop(deliveries);
        drain(&queue, &mut tasks, options.drain_timeout).await;

        let failure = failure.lock().take();
        match failure {
            Some(e) => Err(e),
            None => {
                info!(queue = %queue, "Consumer stopped");
                Ok(())
            }
        }
    }
}

async fn drain(queue: &str, tasks: &mut JoinSet<()>, timeout: Duration) {
    if tasks.is_empty() {
        return;
    }
    debug!(queue, in_flight = tasks.len(), "Draining in-flight messages");

    let drained = tokio::time::timeout(timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            queue,
            abandoned = tasks.len(),
            "Drain timeout elapsed, aborting in-flight messages"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}
