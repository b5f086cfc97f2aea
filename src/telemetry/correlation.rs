//! Request-scoped correlation context.
//!
//! The active {trace id, span id} pair lives in a thread-local slot. Synchronous code activates it
//! with [`begin`], which returns a guard that restores the previous value on drop. Async code
//! wraps futures in [`Correlated`], which installs the context for each poll and restores the
//! previous value before yielding back to the executor. A worker thread polls one future at a time,
//! so two requests interleaved on the same thread (or migrated across threads) never see each
//! other's ids.

use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::ids::{SpanId, TraceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    /// Whether spans under this context are exported. Logs are correlated either way.
    pub sampled: bool,
}

impl CorrelationContext {
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self { Self { trace_id, span_id, sampled: true } }

    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = sampled;
        self
    }

    /// Fresh root context with random ids.
    pub fn random() -> Self { Self::new(TraceId::random(), SpanId::random()) }

    /// Same trace and sampling decision, new span id.
    pub fn child(&self) -> Self { Self { span_id: SpanId::random(), ..*self } }
}

thread_local! {
    static CURRENT: Cell<Option<CorrelationContext>> = const { Cell::new(None) };
}

/// The context active on this execution path, if any.
pub fn current() -> Option<CorrelationContext> {
    CURRENT.with(|c| c.get())
}

fn replace(next: Option<CorrelationContext>) -> Option<CorrelationContext> {
    CURRENT.with(|c| c.replace(next))
}

/// Activate `ctx` until the returned guard is dropped or ended.
pub fn begin(ctx: CorrelationContext) -> ContextGuard {
    ContextGuard { previous: replace(Some(ctx)), _not_send: PhantomData }
}

/// Restores the context that was active before [`begin`].
///
/// Not `Send`: the slot it restores belongs to the thread that created it.
#[must_use = "the context is deactivated as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<CorrelationContext>,
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    pub fn end(self) {}
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        replace(self.previous);
    }
}

/// Run `f` with `ctx` active; the previous context is restored even if `f` panics.
pub fn scope<R>(ctx: CorrelationContext, f: impl FnOnce() -> R) -> R {
    let _guard = begin(ctx);
    f()
}

/// Future adapter that keeps a correlation context active whenever the inner future runs.
pub struct Correlated<F> {
    inner: Option<Pin<Box<F>>>,
    ctx: CorrelationContext,
}

impl<F: Future> Future for Correlated<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let ctx = self.ctx;
        let _guard = begin(ctx);
        match self.inner.as_mut() {
            Some(inner) => {
                let out = inner.as_mut().poll(cx);
                if out.is_ready() { self.inner = None; }
                out
            }
            None => panic!("Correlated polled after completion"),
        }
    }
}

impl<F> Drop for Correlated<F> {
    fn drop(&mut self) {
        // cancellation: anything the inner future logs or closes while dropping stays correlated
        if let Some(inner) = self.inner.take() {
            let _guard = begin(self.ctx);
            drop(inner);
        }
    }
}

pub trait WithCorrelation: Future + Sized {
    fn with_correlation(self, ctx: CorrelationContext) -> Correlated<Self> {
        Correlated { inner: Some(Box::pin(self)), ctx }
    }

    /// Attach whatever context is active right now, if any.
    fn with_current_correlation(self) -> CorrelatedOrPlain<Self> {
        match current() {
            Some(ctx) => CorrelatedOrPlain::Correlated(self.with_correlation(ctx)),
            None => CorrelatedOrPlain::Plain(Box::pin(self)),
        }
    }
}

impl<F: Future> WithCorrelation for F {}

pub enum CorrelatedOrPlain<F> {
    Correlated(Correlated<F>),
    Plain(Pin<Box<F>>),
}

impl<F: Future> Future for CorrelatedOrPlain<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            CorrelatedOrPlain::Correlated(c) => Pin::new(c).poll(cx),
            CorrelatedOrPlain::Plain(p) => p.as_mut().poll(cx),
        }
    }
}

/// `tokio::spawn` that carries the caller's context into the new task.
pub fn spawn<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut.with_current_correlation())
}

/// `tokio::task::spawn_blocking` that carries the caller's context onto the blocking thread.
pub fn spawn_blocking<F, R>(f: F) -> tokio::task::JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let ctx = current();
    tokio::task::spawn_blocking(move || {
        let _guard = ctx.map(begin);
        f()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_end_restores_previous_not_empty() {
        assert_eq!(current(), None);
        let outer = CorrelationContext::random();
        let inner = outer.child();
        let g1 = begin(outer);
        {
            let g2 = begin(inner);
            assert_eq!(current(), Some(inner));
            g2.end();
        }
        assert_eq!(current(), Some(outer));
        g1.end();
        assert_eq!(current(), None);
    }

    #[test]
    fn panic_inside_scope_restores_previous() {
        let outer = CorrelationContext::random();
        let _g = begin(outer);
        let r = std::panic::catch_unwind(|| {
            scope(CorrelationContext::random(), || panic!("handler blew up"))
        });
        assert!(r.is_err());
        assert_eq!(current(), Some(outer));
    }

    #[test]
    fn child_keeps_trace_changes_span() {
        let p = CorrelationContext::random();
        let c = p.child();
        assert_eq!(p.trace_id, c.trace_id);
        assert_ne!(p.span_id, c.span_id);
        assert!(c.sampled);
        assert!(!p.with_sampled(false).child().sampled);
    }

    #[tokio::test]
    async fn correlated_future_sees_context_only_while_polled() {
        let ctx = CorrelationContext::random();
        let seen = async {
            let before = current();
            tokio::task::yield_now().await;
            (before, current())
        }
        .with_correlation(ctx)
        .await;
        assert_eq!(seen, (Some(ctx), Some(ctx)));
        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn failing_future_restores_outer_context() {
        let outer = CorrelationContext::random();
        let _g = begin(outer);
        let res: Result<(), &str> = async { Err("boom") }.with_correlation(outer.child()).await;
        assert!(res.is_err());
        assert_eq!(current(), Some(outer));
    }

    #[tokio::test]
    async fn spawn_blocking_carries_context() {
        let ctx = CorrelationContext::random();
        let got = async { spawn_blocking(current).await.unwrap() }.with_correlation(ctx).await;
        assert_eq!(got, Some(ctx));
    }

    #[tokio::test]
    async fn spawn_carries_context() {
        let ctx = CorrelationContext::random();
        let got = async { spawn(async { current() }).await.unwrap() }.with_correlation(ctx).await;
        assert_eq!(got, Some(ctx));
    }

    #[test]
    fn dropping_unfinished_future_runs_drop_inside_context() {
        struct Probe(std::sync::Arc<parking_lot::Mutex<Option<CorrelationContext>>>);
        impl Drop for Probe {
            fn drop(&mut self) { *self.0.lock() = current(); }
        }
        let slot = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let ctx = CorrelationContext::random();
        let probe = Probe(slot.clone());
        let fut = async move {
            let _p = probe;
            std::future::pending::<()>().await;
        }
        .with_correlation(ctx);
        drop(fut);
        assert_eq!(*slot.lock(), Some(ctx));
        assert_eq!(current(), None);
    }
}
