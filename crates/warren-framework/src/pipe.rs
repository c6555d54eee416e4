//! Pipe chain: ordered payload transforms and validators.
//!
//! Pipes run after routing and before the interceptor chain. Each pipe
//! receives the output of the previous one. The first failure stops the
//! chain and is reported as a [`PipeFailure`] naming the offending pipe.
//!
//! ```rust,ignore
//! Route::new("orders.*.created", on_created)
//!     .schema(PayloadSchema::validated::<Order>())
//!     .pipe(pipe_fn("lowercase-sku", |mut value, _ctx| {
//!         if let Some(sku) = value.get_mut("sku") { /* ... */ }
//!         Ok(value)
//!     }));
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;
use warren_core::{ExecutionContext, ValidationError};

/// A single transform or validation step.
#[async_trait]
pub trait Pipe: Send + Sync + 'static {
    /// Name used in failure reports and logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Transforms `value`, or rejects it.
    ///
    /// A pipe may call [`ExecutionContext::abort`] to skip the remaining
    /// pipes and the handler.
    async fn transform(
        &self,
        value: Value,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, ValidationError>;
}

pub type BoxedPipe = Arc<dyn Pipe>;

/// A pipe rejected the payload.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("pipe '{pipe}' (#{index}) rejected the payload: {error}")]
pub struct PipeFailure {
    pub pipe: String,
    pub index: usize,
    #[source]
    pub error: ValidationError,
}

/// The ordered pipes of one handler entry.
#[derive(Clone, Default)]
pub struct PipeChain {
    pipes: Vec<BoxedPipe>,
}

impl PipeChain {
    pub fn new(pipes: Vec<BoxedPipe>) -> Self {
        Self { pipes }
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipes.iter().map(|p| p.name())
    }

    /// Runs every pipe over the context payload in declaration order.
    ///
    /// On success the final value is stored back into the context. On
    /// failure the payload is left as it was before the failing pipe.
    pub async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), PipeFailure> {
        let mut value = ctx.take_payload();

        for (index, pipe) in self.pipes.iter().enumerate() {
            if ctx.is_aborted() {
                break;
            }
            trace!(pipe = pipe.name(), index, "Running pipe");
            let input = value.clone();
            value = match pipe.transform(value, ctx).await {
                Ok(value) => value,
                Err(error) => {
                    ctx.set_payload(input);
                    return Err(PipeFailure {
                        pipe: pipe.name().to_string(),
                        index,
                        error,
                    });
                }
            };
        }

        ctx.set_payload(value);
        Ok(())
    }
}

impl fmt::Debug for PipeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ============================================================================
// Schema validation
// ============================================================================

/// Domain validation beyond what deserialization checks.
///
/// ```rust,ignore
/// impl Validate for Order {
///     fn validate(&self) -> Result<(), ValidationError> {
///         if self.qty == 0 {
///             return Err(ValidationError::at("qty", "must be positive"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

type SchemaCheck = Arc<dyn Fn(&Value) -> Result<(), ValidationError> + Send + Sync>;

/// The expected shape of a route's payload.
///
/// The payload is checked, never coerced: it reaches later pipes unchanged.
#[derive(Clone)]
pub struct PayloadSchema {
    name: &'static str,
    check: SchemaCheck,
}

impl PayloadSchema {
    /// Payload must deserialize into `T`.
    pub fn of<T: DeserializeOwned + 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            check: Arc::new(|value: &Value| {
                T::deserialize(value)
                    .map(|_| ())
                    .map_err(ValidationError::from)
            }),
        }
    }

    /// Payload must deserialize into `T` and pass [`Validate::validate`].
    pub fn validated<T: DeserializeOwned + Validate + 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            check: Arc::new(|value: &Value| T::deserialize(value)?.validate()),
        }
    }

    /// Schema from an arbitrary check.
    pub fn custom<F>(name: &'static str, check: F) -> Self
    where
        F: Fn(&Value) -> Result<(), ValidationError> + Send + Sync + 'static,
    {
        Self {
            name,
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn check(&self, value: &Value) -> Result<(), ValidationError> {
        (self.check)(value)
    }
}

impl fmt::Debug for PayloadSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSchema")
            .field("name", &self.name)
            .finish()
    }
}

/// Pipe enforcing a [`PayloadSchema`]. Always first in its chain.
#[derive(Debug, Clone)]
pub struct SchemaPipe {
    schema: PayloadSchema,
}

impl SchemaPipe {
    pub fn new(schema: PayloadSchema) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl Pipe for SchemaPipe {
    fn name(&self) -> &str {
        "schema"
    }

    async fn transform(
        &self,
        value: Value,
        _ctx: &mut ExecutionContext,
    ) -> Result<Value, ValidationError> {
        self.schema.check(&value)?;
        Ok(value)
    }
}

// ============================================================================
// Closure pipes
// ============================================================================

type PipeFn =
    Arc<dyn Fn(Value, &mut ExecutionContext) -> Result<Value, ValidationError> + Send + Sync>;

/// A synchronous pipe built from a closure.
#[derive(Clone)]
pub struct FnPipe {
    name: String,
    f: PipeFn,
}

#[async_trait]
impl Pipe for FnPipe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transform(
        &self,
        value: Value,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, ValidationError> {
        (self.f)(value, ctx)
    }
}

/// Creates a named pipe from a closure.
pub fn pipe_fn<F>(name: impl Into<String>, f: F) -> FnPipe
where
    F: Fn(Value, &mut ExecutionContext) -> Result<Value, ValidationError> + Send + Sync + 'static,
{
    FnPipe {
        name: name.into(),
        f: Arc::new(f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use serde_json::json;
    use warren_core::{DeliveryTag, InboundMessage};

    fn context(payload: Value) -> ExecutionContext {
        let message = InboundMessage::new("q", "k", Vec::new(), DeliveryTag::new(1));
        let mut ctx = ExecutionContext::new(message, "Test::handler");
        ctx.set_payload(payload);
        ctx
    }

    #[derive(Deserialize)]
    struct Order {
        qty: u32,
    }

    impl Validate for Order {
        fn validate(&self) -> Result<(), ValidationError> {
            if self.qty == 0 {
                return Err(ValidationError::at("qty", "must be positive"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pipes_run_in_order_and_stop_at_first_failure() {
        let seen_by_b = Arc::new(Mutex::new(None));
        let seen = seen_by_b.clone();
        let c_ran = Arc::new(Mutex::new(false));
        let c_flag = c_ran.clone();

        let chain = PipeChain::new(vec![
            Arc::new(pipe_fn("a", |mut v, _| {
                v["a"] = json!(true);
                Ok(v)
            })),
            Arc::new(pipe_fn("b", move |v, _| {
                *seen.lock() = Some(v);
                Err(ValidationError::new("b says no"))
            })),
            Arc::new(pipe_fn("c", move |v, _| {
                *c_flag.lock() = true;
                Ok(v)
            })),
        ]);

        let mut ctx = context(json!({}));
        let failure = chain.run(&mut ctx).await.unwrap_err();

        assert_eq!(failure.pipe, "b");
        assert_eq!(failure.index, 1);
        assert_eq!(seen_by_b.lock().clone(), Some(json!({"a": true})));
        assert!(!*c_ran.lock());
    }

    #[tokio::test]
    async fn test_output_is_stored_in_context() {
        let chain = PipeChain::new(vec![Arc::new(pipe_fn("inc", |v, _| {
            Ok(json!(v.as_i64().unwrap_or(0) + 1))
        }))]);
        let mut ctx = context(json!(1));
        chain.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.payload(), &json!(2));
    }

    #[tokio::test]
    async fn test_abort_skips_remaining_pipes() {
        let chain = PipeChain::new(vec![
            Arc::new(pipe_fn("dedupe", |v, ctx| {
                ctx.abort("duplicate");
                Ok(v)
            })),
            Arc::new(pipe_fn("never", |_, _| Err(ValidationError::new("ran")))),
        ]);
        let mut ctx = context(json!({}));
        assert!(chain.run(&mut ctx).await.is_ok());
        assert_eq!(ctx.abort_reason(), Some("duplicate"));
    }

    #[tokio::test]
    async fn test_schema_pipe() {
        let pipe = SchemaPipe::new(PayloadSchema::validated::<Order>());

        let mut ctx = context(Value::Null);
        let ok = pipe.transform(json!({"qty": 2}), &mut ctx).await.unwrap();
        assert_eq!(ok, json!({"qty": 2}));

        let zero = pipe.transform(json!({"qty": 0}), &mut ctx).await.unwrap_err();
        assert_eq!(zero.path.as_deref(), Some("qty"));

        // strings are not coerced into numbers
        assert!(pipe.transform(json!({"qty": "2"}), &mut ctx).await.is_err());
    }
}
