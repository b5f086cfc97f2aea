//! Named spans nested under the active correlation context.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::correlation::{self, CorrelationContext, WithCorrelation};
use super::export::BatchSpanProcessor;
use super::ids::{SpanId, TraceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Internal,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error(String),
}

/// A finished span as handed to exporters.
#[derive(Debug, Clone, Serialize)]
pub struct SpanData {
    pub name: String,
    pub kind: SpanKind,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub start_unix_nanos: u64,
    pub end_unix_nanos: u64,
    pub attributes: Vec<(String, String)>,
    pub status: SpanStatus,
}

fn unix_nanos() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

/// Creates spans and routes finished ones to the batch processor.
///
/// Cheap to clone. A disabled tracer still hands out ids so correlation works, but drops spans.
#[derive(Clone)]
pub struct Tracer {
    processor: Option<Arc<BatchSpanProcessor>>,
}

impl Tracer {
    pub fn new(processor: BatchSpanProcessor) -> Self { Self { processor: Some(Arc::new(processor)) } }

    pub fn disabled() -> Self { Self { processor: None } }

    /// Child of the current correlation context, or a new trace when none is active.
    pub fn start_span(&self, name: impl Into<String>) -> SpanHandle {
        self.start_span_with_parent(name, correlation::current(), SpanKind::Internal)
    }

    pub fn start_span_with_parent(
        &self,
        name: impl Into<String>,
        parent: Option<CorrelationContext>,
        kind: SpanKind,
    ) -> SpanHandle {
        let (trace_id, parent_span_id, sampled) = match parent {
            Some(p) => (p.trace_id, Some(p.span_id), p.sampled),
            None => (TraceId::random(), None, true),
        };
        SpanHandle {
            sampled,
            data: Some(SpanData {
                name: name.into(),
                kind,
                trace_id,
                span_id: SpanId::random(),
                parent_span_id,
                start_unix_nanos: unix_nanos(),
                end_unix_nanos: 0,
                attributes: Vec::new(),
                status: SpanStatus::Unset,
            }),
            tracer: self.clone(),
        }
    }

    /// Run `fut` inside a new child span with that span's context active.
    ///
    /// The span closes `Ok` or `Error` according to the result; if the returned future is dropped
    /// before completion the span closes as cancelled.
    pub async fn in_span<F, T, E>(&self, name: &str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let span = self.start_span(name);
        let out = fut.with_correlation(span.context()).await;
        match &out {
            Ok(_) => span.close(),
            Err(e) => span.close_with_error(e.to_string()),
        }
        out
    }

    pub async fn force_flush(&self) {
        if let Some(p) = &self.processor { p.force_flush().await; }
    }

    pub async fn shutdown(&self) {
        if let Some(p) = &self.processor { p.shutdown().await; }
    }

    fn finish(&self, span: SpanData, sampled: bool) {
        tracing::trace!(target: "span", name = %span.name, span_id = %span.span_id, sampled, "span closed");
        if !sampled { return; }
        if let Some(p) = &self.processor { p.on_end(span); }
    }
}

/// An open span. Closed exactly once: explicitly, or as cancelled on drop.
pub struct SpanHandle {
    sampled: bool,
    data: Option<SpanData>,
    tracer: Tracer,
}

impl SpanHandle {
    /// The context logs inside this span should carry.
    pub fn context(&self) -> CorrelationContext {
        match &self.data {
            Some(d) => CorrelationContext::new(d.trace_id, d.span_id).with_sampled(self.sampled),
            None => CorrelationContext::random().with_sampled(self.sampled),
        }
    }

    pub fn parent_span_id(&self) -> Option<SpanId> { self.data.as_ref().and_then(|d| d.parent_span_id) }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl ToString) {
        if let Some(d) = self.data.as_mut() { d.attributes.push((key.into(), value.to_string())); }
    }

    pub fn close(mut self) { self.finish(SpanStatus::Ok); }

    pub fn close_with_error(mut self, message: impl Into<String>) { self.finish(SpanStatus::Error(message.into())); }

    fn finish(&mut self, status: SpanStatus) {
        if let Some(mut d) = self.data.take() {
            d.status = status;
            d.end_unix_nanos = unix_nanos().max(d.start_unix_nanos);
            self.tracer.finish(d, self.sampled);
        }
    }
}

impl Drop for SpanHandle {
    fn drop(&mut self) {
        if self.data.is_some() {
            tracing::debug!(target: "span", "span dropped before close");
            self.finish(SpanStatus::Error("cancelled".into()));
        }
    }
}
