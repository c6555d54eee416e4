//! Extractor system for the Warren framework.
//!
//! This module provides the [`FromContext`] trait, which defines how handler
//! parameters are pulled out of an [`ExecutionContext`]. Extraction runs after
//! the pipe chain, so extractors see the transformed payload.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use serde::de::DeserializeOwned;
use serde_json::Value;
use warren_core::{ExecutionContext, Headers, InboundMessage};

use crate::error::{ExtractError, ExtractResult};

/// A trait for types that can be extracted from an [`ExecutionContext`].
///
/// A failed extraction turns into an `invalid` [`HandlerError`] and the
/// handler body never runs.
///
/// [`HandlerError`]: warren_core::HandlerError
///
/// # Example
///
/// ```rust,ignore
/// struct Tenant(String);
///
/// impl FromContext for Tenant {
///     fn from_context(ctx: &ExecutionContext) -> ExtractResult<Self> {
///         ctx.message()
///             .headers
///             .get("x-tenant")
///             .and_then(|v| v.as_str())
///             .map(|t| Tenant(t.to_string()))
///             .ok_or(ExtractError::Missing("x-tenant header"))
///     }
/// }
/// ```
pub trait FromContext: Sized {
    fn from_context(ctx: &ExecutionContext) -> ExtractResult<Self>;
}

/// The decoded payload, deserialized into `T`.
///
/// ```rust,ignore
/// async fn echo(Payload(req): Payload<EchoRequest>) -> Json<EchoReply> {
///     Json(EchoReply { v: req.v * 2 })
/// }
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Payload<T>(pub T);

impl<T> Payload<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Payload<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Payload<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: DeserializeOwned> FromContext for Payload<T> {
    fn from_context(ctx: &ExecutionContext) -> ExtractResult<Self> {
        serde_json::from_value(ctx.payload().clone())
            .map(Payload)
            .map_err(|e| ExtractError::PayloadMismatch {
                expected: std::any::type_name::<T>(),
                reason: e.to_string(),
            })
    }
}

/// The raw decoded payload.
impl FromContext for Value {
    fn from_context(ctx: &ExecutionContext) -> ExtractResult<Self> {
        Ok(ctx.payload().clone())
    }
}

/// A copy of the inbound message.
impl FromContext for InboundMessage {
    fn from_context(ctx: &ExecutionContext) -> ExtractResult<Self> {
        Ok(ctx.message().clone())
    }
}

/// Message headers.
#[derive(Debug, Clone, Default)]
pub struct MessageHeaders(pub Headers);

impl FromContext for MessageHeaders {
    fn from_context(ctx: &ExecutionContext) -> ExtractResult<Self> {
        Ok(MessageHeaders(ctx.message().headers.clone()))
    }
}

/// The routing key the message was published with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey(pub String);

impl FromContext for RoutingKey {
    fn from_context(ctx: &ExecutionContext) -> ExtractResult<Self> {
        Ok(RoutingKey(ctx.message().routing_key.clone()))
    }
}

/// The correlation id. Extraction fails if the message has none; wrap in
/// `Option` for messages that may lack one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl FromContext for CorrelationId {
    fn from_context(ctx: &ExecutionContext) -> ExtractResult<Self> {
        ctx.message()
            .correlation_id
            .clone()
            .map(CorrelationId)
            .ok_or(ExtractError::Missing("correlation id"))
    }
}

/// Metadata accumulated by pipes and interceptors.
#[derive(Debug, Clone, Default)]
pub struct Metadata(pub HashMap<String, Value>);

impl Metadata {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl FromContext for Metadata {
    fn from_context(ctx: &ExecutionContext) -> ExtractResult<Self> {
        Ok(Metadata(ctx.metadata_map().clone()))
    }
}

/// Optional extraction: failures become `None`.
impl<T: FromContext> FromContext for Option<T> {
    fn from_context(ctx: &ExecutionContext) -> ExtractResult<Self> {
        Ok(T::from_context(ctx).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use warren_core::DeliveryTag;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    fn context(payload: Value) -> ExecutionContext {
        let message = InboundMessage::new("orders", "orders.eu.created", Vec::new(), DeliveryTag::new(1))
            .with_header("x-tenant", "acme");
        let mut ctx = ExecutionContext::new(message, "Orders::created");
        ctx.set_payload(payload);
        ctx
    }

    #[test]
    fn test_payload_extraction() {
        let ctx = context(json!({"id": 3}));
        let Payload(order) = Payload::<Order>::from_context(&ctx).unwrap();
        assert_eq!(order, Order { id: 3 });
    }

    #[test]
    fn test_payload_mismatch() {
        let ctx = context(json!({"id": "three"}));
        let err = Payload::<Order>::from_context(&ctx).unwrap_err();
        assert!(matches!(err, ExtractError::PayloadMismatch { .. }));
    }

    #[test]
    fn test_message_properties() {
        let ctx = context(Value::Null);
        assert_eq!(
            RoutingKey::from_context(&ctx).unwrap(),
            RoutingKey("orders.eu.created".into())
        );
        assert_eq!(
            MessageHeaders::from_context(&ctx).unwrap().0.get("x-tenant"),
            Some(&json!("acme"))
        );
        assert!(CorrelationId::from_context(&ctx).is_err());
        assert_eq!(Option::<CorrelationId>::from_context(&ctx).unwrap(), None);
    }
}
