//! Interceptor chain: ordered around-handlers.
//!
//! The chain is a slice walked by index. [`Next::run`] invokes the next
//! interceptor, or the handler once the slice is exhausted. The first
//! interceptor in the slice is the outermost one.
//!
//! ```text
//!   Outer ──▶ Inner ──▶ Handler
//!   Outer ◀── Inner ◀──
//! ```
//!
//! An interceptor observes the full [`HandlerResult`] returned by `next`, so
//! its "after" code runs on failure too. Not calling `next` short-circuits
//! the chain.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};
use warren_core::{ExecutionContext, HandlerError, HandlerResult};

use crate::handler::ErasedHandler;

/// Code wrapped around a handler invocation.
///
/// # Example
///
/// ```rust,ignore
/// struct RequireTenant;
///
/// #[async_trait]
/// impl Interceptor for RequireTenant {
///     async fn intercept(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> HandlerResult {
///         if !ctx.message().headers.contains_key("x-tenant") {
///             return Err(HandlerError::invalid("missing x-tenant header"));
///         }
///         next.run(ctx).await
///     }
/// }
/// ```
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn intercept(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> HandlerResult;
}

pub type BoxedInterceptor = Arc<dyn Interceptor>;

/// The remainder of an interceptor chain.
///
/// `Next` is `Copy`, so an interceptor may run the rest of the chain more
/// than once (see [`Retry`]).
#[derive(Clone, Copy)]
pub struct Next<'a> {
    interceptors: &'a [BoxedInterceptor],
    handler: &'a dyn ErasedHandler,
}

impl<'a> Next<'a> {
    pub fn new(interceptors: &'a [BoxedInterceptor], handler: &'a dyn ErasedHandler) -> Self {
        Self {
            interceptors,
            handler,
        }
    }

    /// Runs the next interceptor, or the handler if none remain.
    ///
    /// A panicking handler yields a permanent [`HandlerError`], so every
    /// interceptor still sees the failure.
    pub async fn run(self, ctx: &mut ExecutionContext) -> HandlerResult {
        match self.interceptors.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    interceptors: rest,
                    handler: self.handler,
                };
                current.intercept(ctx, next).await
            }
            None => {
                let handler = self.handler;
                let ctx: &ExecutionContext = ctx;
                AssertUnwindSafe(async move { handler.call(ctx).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(HandlerError::permanent(format!(
                            "handler panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    })
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The ordered interceptors of one handler entry.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<BoxedInterceptor>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<BoxedInterceptor>) -> Self {
        Self { interceptors }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.interceptors.iter().map(|i| i.name())
    }

    /// Runs the chain around `handler`.
    pub async fn run(&self, ctx: &mut ExecutionContext, handler: &dyn ErasedHandler) -> HandlerResult {
        Next::new(&self.interceptors, handler).run(ctx).await
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ============================================================================
// Built-in interceptors
// ============================================================================

/// Records handler duration as `elapsed_ms` metadata and logs it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timing;

#[async_trait]
impl Interceptor for Timing {
    fn name(&self) -> &str {
        "timing"
    }

    async fn intercept(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> HandlerResult {
        let started = Instant::now();
        let result = next.run(ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        ctx.insert_metadata("elapsed_ms", elapsed_ms);
        debug!(
            handler = ctx.handler(),
            elapsed_ms,
            ok = result.is_ok(),
            "Handler finished"
        );
        result
    }
}

type ErrorMapper = Arc<dyn Fn(HandlerError) -> HandlerError + Send + Sync>;

/// Rewrites errors returned by the inner chain.
///
/// ```rust,ignore
/// // Treat every failure of a flaky dependency as retryable
/// MapErr::new(|e| e.with_kind(ErrorKind::Transient))
/// ```
#[derive(Clone)]
pub struct MapErr {
    f: ErrorMapper,
}

impl MapErr {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(HandlerError) -> HandlerError + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl Interceptor for MapErr {
    fn name(&self) -> &str {
        "map-err"
    }

    async fn intercept(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> HandlerResult {
        next.run(ctx).await.map_err(|e| (self.f)(e))
    }
}

/// Retries transient failures in-process before the message is requeued.
///
/// The delay doubles after each attempt. Only the last error is returned.
#[derive(Debug, Clone)]
pub struct Retry {
    attempts: u32,
    backoff: Duration,
}

impl Retry {
    /// Runs the inner chain up to `attempts` times in total.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Duration::from_millis(100),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl Interceptor for Retry {
    fn name(&self) -> &str {
        "retry"
    }

    async fn intercept(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> HandlerResult {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match next.run(ctx).await {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    warn!(
                        handler = ctx.handler(),
                        attempt,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::into_handler;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use warren_core::{DeliveryTag, ErrorKind, InboundMessage, Reply};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        label: &'static str,
        log: Log,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        async fn intercept(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> HandlerResult {
            self.log.lock().push(format!("{}-before", self.label));
            let result = next.run(ctx).await;
            self.log.lock().push(format!("{}-after", self.label));
            result
        }
    }

    struct Deny;

    #[async_trait]
    impl Interceptor for Deny {
        async fn intercept(&self, _ctx: &mut ExecutionContext, _next: Next<'_>) -> HandlerResult {
            Err(HandlerError::permanent("denied"))
        }
    }

    fn context() -> ExecutionContext {
        let message = InboundMessage::new("q", "k", Vec::new(), DeliveryTag::new(1));
        ExecutionContext::new(message, "Test::handler")
    }

    fn chain(log: &Log) -> InterceptorChain {
        InterceptorChain::new(vec![
            Arc::new(Recorder {
                label: "outer",
                log: log.clone(),
            }),
            Arc::new(Recorder {
                label: "inner",
                log: log.clone(),
            }),
        ])
    }

    const EXPECTED: [&str; 5] = [
        "outer-before",
        "inner-before",
        "handler",
        "inner-after",
        "outer-after",
    ];

    #[tokio::test]
    async fn test_nesting_order_on_success() {
        let log: Log = Arc::default();
        let handler_log = log.clone();
        let handler = into_handler(move || {
            handler_log.lock().push("handler".into());
            async { Reply::json(&1) }
        });

        let result = chain(&log).run(&mut context(), handler.as_ref()).await;

        assert!(result.is_ok());
        assert_eq!(*log.lock(), EXPECTED);
    }

    #[tokio::test]
    async fn test_nesting_order_on_failure() {
        let log: Log = Arc::default();
        let handler_log = log.clone();
        let handler = into_handler(move || {
            handler_log.lock().push("handler".into());
            async { Err::<(), _>(HandlerError::permanent("boom")) }
        });

        let result = chain(&log).run(&mut context(), handler.as_ref()).await;

        assert_eq!(result.unwrap_err().message(), "boom");
        assert_eq!(*log.lock(), EXPECTED);
    }

    async fn boom() {
        panic!("boom");
    }

    #[tokio::test]
    async fn test_handler_panic_unwinds_through_interceptors_as_error() {
        let log: Log = Arc::default();
        let handler_log = log.clone();
        let handler = into_handler(move || {
            handler_log.lock().push("handler".into());
            boom()
        });
        let chain = InterceptorChain::new(vec![
            Arc::new(Recorder {
                label: "outer",
                log: log.clone(),
            }),
            Arc::new(MapErr::new(|e| e.with_code(500))),
            Arc::new(Recorder {
                label: "inner",
                log: log.clone(),
            }),
        ]);

        let err = chain.run(&mut context(), handler.as_ref()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(err.message(), "handler panicked: boom");
        assert_eq!(err.code(), Some(500));
        assert_eq!(*log.lock(), EXPECTED);
    }

    #[tokio::test]
    async fn test_timing_records_metadata_when_handler_panics() {
        let chain = InterceptorChain::new(vec![Arc::new(Timing)]);
        let handler = into_handler(boom);
        let mut ctx = context();
        assert!(chain.run(&mut ctx, handler.as_ref()).await.is_err());
        assert!(ctx.metadata("elapsed_ms").is_some());
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let handler = into_handler(move || {
            *flag.lock() = true;
            async {}
        });

        let chain = InterceptorChain::new(vec![Arc::new(Deny)]);
        let result = chain.run(&mut context(), handler.as_ref()).await;

        assert_eq!(result.unwrap_err().message(), "denied");
        assert!(!*ran.lock());
    }

    #[tokio::test]
    async fn test_timing_records_metadata() {
        let chain = InterceptorChain::new(vec![Arc::new(Timing)]);
        let handler = into_handler(|| async {});
        let mut ctx = context();
        chain.run(&mut ctx, handler.as_ref()).await.unwrap();
        assert!(ctx.metadata("elapsed_ms").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = into_handler(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(HandlerError::transient("busy"))
                } else {
                    Ok(())
                }
            }
        });

        let chain = InterceptorChain::new(vec![Arc::new(Retry::new(3))]);
        assert!(chain.run(&mut context(), handler.as_ref()).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_ignores_permanent() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = into_handler(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HandlerError::permanent("no")) }
        });

        let chain = InterceptorChain::new(vec![Arc::new(Retry::new(5))]);
        assert!(chain.run(&mut context(), handler.as_ref()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_map_err() {
        let handler = into_handler(|| async { Err::<(), _>(HandlerError::permanent("flaky")) });
        let chain = InterceptorChain::new(vec![Arc::new(MapErr::new(|e| {
            e.with_kind(warren_core::ErrorKind::Transient)
        }))]);
        let err = chain.run(&mut context(), handler.as_ref()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
