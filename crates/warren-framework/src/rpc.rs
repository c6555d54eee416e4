//! Request/reply client.
//!
//! [`RpcClient`] owns an exclusive, server-named reply queue. Each request
//! gets a fresh correlation id; a background listener acks every reply and
//! completes the matching pending call. Replies nobody waits for anymore
//! (timed out, or foreign) are acked and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use warren_core::{BoxedGateway, GatewayError, InboundMessage, OutboundMessage, QueueSpec};

use crate::wire::RemoteError;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode reply: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("no reply for '{routing_key}' within {timeout:?}")]
    Timeout {
        routing_key: String,
        timeout: Duration,
    },

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("rpc client closed")]
    Closed,
}

pub type RpcResult<T> = Result<T, RpcError>;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<InboundMessage>>>>;

/// Client side of the request/reply pattern.
pub struct RpcClient {
    gateway: BoxedGateway,
    reply_queue: String,
    timeout: Duration,
    pending: Pending,
    listener: JoinHandle<()>,
}

impl RpcClient {
    /// Declares the reply queue and starts listening on it.
    pub async fn start(gateway: BoxedGateway, timeout: Duration) -> RpcResult<Self> {
        let reply_queue = gateway.declare_queue(&QueueSpec::exclusive("")).await?;
        let mut replies = gateway.consume(&reply_queue, 0).await?;
        let pending: Pending = Arc::default();

        let listener = {
            let gateway = gateway.clone();
            let pending = Arc::clone(&pending);
            let queue = reply_queue.clone();
            tokio::spawn(async move {
                while let Some(next) = replies.next().await {
                    let reply = match next {
                        Ok(reply) => reply,
                        Err(e) => {
                            debug!(queue = %queue, error = %e, "Reply stream closed");
                            break;
                        }
                    };
                    if let Err(e) = gateway.ack(reply.delivery_tag).await {
                        warn!(queue = %queue, error = %e, "Failed to ack reply");
                    }

                    let waiter = reply
                        .correlation_id
                        .as_deref()
                        .and_then(|id| pending.lock().remove(id));
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(reply);
                        }
                        None => trace!(
                            correlation_id = ?reply.correlation_id,
                            "Dropping reply without a waiting caller"
                        ),
                    }
                }
                // wake everyone still waiting
                pending.lock().clear();
            })
        };

        debug!(reply_queue = %reply_queue, "RPC client started");
        Ok(Self {
            gateway,
            reply_queue,
            timeout,
            pending,
            listener,
        })
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Sends `request` and waits for the typed reply using the default timeout.
    pub async fn send<T, R>(&self, exchange: &str, routing_key: &str, request: &T) -> RpcResult<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send_with_timeout(exchange, routing_key, request, self.timeout)
            .await
    }

    pub async fn send_with_timeout<T, R>(
        &self,
        exchange: &str,
        routing_key: &str,
        request: &T,
        timeout: Duration,
    ) -> RpcResult<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self.call(exchange, routing_key, request, timeout).await?;
        if let Some(remote) = RemoteError::from_headers(&reply.headers) {
            return Err(remote.into());
        }
        serde_json::from_slice(&reply.payload).map_err(RpcError::Decode)
    }

    /// Sends `request` and returns the raw reply delivery.
    pub async fn call<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        request: &T,
        timeout: Duration,
    ) -> RpcResult<InboundMessage>
    where
        T: Serialize + ?Sized,
    {
        if self.listener.is_finished() {
            return Err(RpcError::Closed);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let message = OutboundMessage::json(exchange, routing_key, request)
            .map_err(RpcError::Encode)?
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(self.reply_queue.clone());

        let (tx, rx) = oneshot::channel();
        let _registration = PendingCall::register(&self.pending, correlation_id, tx);

        self.gateway.publish(message).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => Err(RpcError::Timeout {
                routing_key: routing_key.to_string(),
                timeout,
            }),
        }
    }

    /// Publishes without expecting a reply.
    pub async fn notify<T>(&self, exchange: &str, routing_key: &str, request: &T) -> RpcResult<()>
    where
        T: Serialize + ?Sized,
    {
        let message =
            OutboundMessage::json(exchange, routing_key, request).map_err(RpcError::Encode)?;
        self.gateway.publish(message).await?;
        Ok(())
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stops the listener and fails outstanding calls with [`RpcError::Closed`].
    pub fn close(self) {
        self.listener.abort();
        self.pending.lock().clear();
    }
}

/// A waiting call's entry in the pending map, removed when the call ends,
/// including when its future is dropped.
struct PendingCall<'a> {
    pending: &'a Pending,
    correlation_id: String,
}

impl<'a> PendingCall<'a> {
    fn register(
        pending: &'a Pending,
        correlation_id: String,
        tx: oneshot::Sender<InboundMessage>,
    ) -> Self {
        pending.lock().insert(correlation_id.clone(), tx);
        Self {
            pending,
            correlation_id,
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("reply_queue", &self.reply_queue)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending())
            .finish()
    }
}
