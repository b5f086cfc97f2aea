//! Trace/log correlation and span export.
//! Request code only touches `correlation` and `Tracer`; exporters are wired at startup.

pub mod correlation;
pub mod export;
pub mod ids;
pub mod logging;
pub mod span;

pub use correlation::{begin, current, ContextGuard, Correlated, CorrelationContext, WithCorrelation};
pub use export::{BatchConfig, BatchSpanProcessor, ConsoleExporter, InMemoryExporter, OtlpHttpExporter, SpanExporter};
pub use ids::{format_traceparent, parse_traceparent, RemoteParent, SpanId, TraceId};
pub use span::{SpanData, SpanHandle, SpanKind, SpanStatus, Tracer};
