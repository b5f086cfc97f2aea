//! Asynchronous batching span export.
//!
//! Finished spans go onto a bounded queue drained by a background task that batches them and
//! pushes each batch to every configured exporter. Export is best effort: failures are logged
//! and the batch is discarded, a full queue drops the span. Nothing here reports back to the
//! request path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::span::{SpanData, SpanKind, SpanStatus};

pub trait SpanExporter: Send + Sync {
    fn name(&self) -> &'static str;
    fn export<'a>(&'a self, batch: &'a [SpanData]) -> BoxFuture<'a, anyhow::Result<()>>;
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_queue_size: usize,
    pub max_export_batch_size: usize,
    pub scheduled_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_queue_size: 2048, max_export_batch_size: 512, scheduled_delay: Duration::from_secs(5) }
    }
}

enum Message {
    Span(SpanData),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

pub struct BatchSpanProcessor {
    tx: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
}

impl BatchSpanProcessor {
    /// Start the export worker on the current tokio runtime.
    pub fn spawn(exporters: Vec<Arc<dyn SpanExporter>>, config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.max_queue_size.max(1));
        tokio::spawn(run_worker(rx, exporters, config));
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn on_end(&self, span: SpanData) {
        match self.tx.try_send(Message::Span(span)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(target: "export", dropped_total = n, "span queue full; dropping span");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Spans rejected because the queue was full or the worker had stopped.
    pub fn dropped_spans(&self) -> u64 { self.dropped.load(Ordering::Relaxed) }

    /// Export everything queued so far and wait for it.
    pub async fn force_flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Message::Flush(ack)).await.is_ok() { let _ = done.await; }
    }

    /// Flush and stop the worker. Later spans are dropped.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Message::Shutdown(ack)).await.is_ok() { let _ = done.await; }
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Message>, exporters: Vec<Arc<dyn SpanExporter>>, config: BatchConfig) {
    let batch_size = config.max_export_batch_size.max(1);
    let mut batch: Vec<SpanData> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(config.scheduled_delay);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Message::Span(span)) => {
                    batch.push(span);
                    if batch.len() >= batch_size { export_batch(&exporters, &mut batch).await; }
                }
                Some(Message::Flush(ack)) => {
                    export_batch(&exporters, &mut batch).await;
                    let _ = ack.send(());
                }
                Some(Message::Shutdown(ack)) => {
                    export_batch(&exporters, &mut batch).await;
                    rx.close();
                    let _ = ack.send(());
                    break;
                }
                None => {
                    export_batch(&exporters, &mut batch).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() { export_batch(&exporters, &mut batch).await; }
            }
        }
    }
    debug!(target: "export", "span export worker stopped");
}

async fn export_batch(exporters: &[Arc<dyn SpanExporter>], batch: &mut Vec<SpanData>) {
    if batch.is_empty() { return; }
    for exp in exporters {
        if let Err(e) = exp.export(batch).await {
            warn!(target: "export", exporter = exp.name(), spans = batch.len(), "span export failed: {e:#}");
        }
    }
    batch.clear();
}

/// OTLP/HTTP with the JSON encoding, posted to `<endpoint>/v1/traces`.
pub struct OtlpHttpExporter {
    url: String,
    service_name: String,
    client: reqwest::Client,
}

impl OtlpHttpExporter {
    pub fn new(endpoint: &str, service_name: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building OTLP http client")?;
        Ok(Self {
            url: format!("{}/v1/traces", endpoint.trim_end_matches('/')),
            service_name: service_name.to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str { &self.url }
}

impl SpanExporter for OtlpHttpExporter {
    fn name(&self) -> &'static str { "otlp" }

    fn export<'a>(&'a self, batch: &'a [SpanData]) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let body = otlp_json(&self.service_name, batch);
            let resp = self.client.post(&self.url).json(&body).send().await
                .with_context(|| format!("POST {}", self.url))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(anyhow!("collector answered {status}"));
            }
            Ok(())
        })
    }
}

fn attr(key: &str, value: &str) -> Value {
    json!({ "key": key, "value": { "stringValue": value } })
}

/// Build an `ExportTraceServiceRequest` in OTLP/JSON form. Ids are hex, timestamps are
/// decimal strings, as the protobuf JSON mapping requires for 64-bit integers.
pub fn otlp_json(service_name: &str, batch: &[SpanData]) -> Value {
    let spans: Vec<Value> = batch.iter().map(|s| {
        let (code, message) = match &s.status {
            SpanStatus::Unset => (0, String::new()),
            SpanStatus::Ok => (1, String::new()),
            SpanStatus::Error(m) => (2, m.clone()),
        };
        let kind = match s.kind { SpanKind::Internal => 1, SpanKind::Server => 2 };
        let mut span = json!({
            "traceId": s.trace_id.to_string(),
            "spanId": s.span_id.to_string(),
            "name": s.name,
            "kind": kind,
            "startTimeUnixNano": s.start_unix_nanos.to_string(),
            "endTimeUnixNano": s.end_unix_nanos.to_string(),
            "attributes": s.attributes.iter().map(|(k, v)| attr(k, v)).collect::<Vec<_>>(),
            "status": { "code": code, "message": message },
        });
        if let Some(p) = s.parent_span_id {
            span["parentSpanId"] = json!(p.to_string());
        }
        span
    }).collect();
    json!({
        "resourceSpans": [{
            "resource": { "attributes": [attr("service.name", service_name)] },
            "scopeSpans": [{
                "scope": { "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") },
                "spans": spans,
            }],
        }],
    })
}

/// One JSON object per span on stdout, for local debugging.
#[derive(Debug, Default)]
pub struct ConsoleExporter;

impl SpanExporter for ConsoleExporter {
    fn name(&self) -> &'static str { "console" }

    fn export<'a>(&'a self, batch: &'a [SpanData]) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut buf = Vec::with_capacity(batch.len() * 256);
            for span in batch {
                serde_json::to_writer(&mut buf, span)?;
                buf.push(b'\n');
            }
            let mut out = tokio::io::stdout();
            out.write_all(&buf).await?;
            out.flush().await?;
            Ok(())
        })
    }
}

/// Keeps every exported span in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemoryExporter {
    pub fn spans(&self) -> Vec<SpanData> { self.spans.lock().clone() }
    pub fn clear(&self) { self.spans.lock().clear(); }
}

impl SpanExporter for InMemoryExporter {
    fn name(&self) -> &'static str { "memory" }

    fn export<'a>(&'a self, batch: &'a [SpanData]) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.spans.lock().extend_from_slice(batch);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ids::{SpanId, TraceId};

    struct FailingExporter;

    impl SpanExporter for FailingExporter {
        fn name(&self) -> &'static str { "failing" }
        fn export<'a>(&'a self, _batch: &'a [SpanData]) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async { Err(anyhow!("collector unreachable")) })
        }
    }

    fn span(name: &str) -> SpanData {
        SpanData {
            name: name.into(),
            kind: SpanKind::Internal,
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            parent_span_id: None,
            start_unix_nanos: 1,
            end_unix_nanos: 2,
            attributes: vec![],
            status: SpanStatus::Ok,
        }
    }

    #[tokio::test]
    async fn failing_exporter_does_not_starve_the_others() {
        let mem = InMemoryExporter::default();
        let p = BatchSpanProcessor::spawn(vec![Arc::new(FailingExporter) as Arc<dyn SpanExporter>, Arc::new(mem.clone())], BatchConfig::default());
        p.on_end(span("a"));
        p.on_end(span("b"));
        p.force_flush().await;
        let names: Vec<String> = mem.spans().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn full_batch_exports_without_flush() {
        let mem = InMemoryExporter::default();
        let cfg = BatchConfig { max_export_batch_size: 2, scheduled_delay: Duration::from_secs(3600), ..BatchConfig::default() };
        let p = BatchSpanProcessor::spawn(vec![Arc::new(mem.clone()) as Arc<dyn SpanExporter>], cfg);
        p.on_end(span("a"));
        p.on_end(span("b"));
        for _ in 0..100 {
            if mem.spans().len() == 2 { break; }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mem.spans().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_flushes_then_drops_later_spans() {
        let mem = InMemoryExporter::default();
        let p = BatchSpanProcessor::spawn(vec![Arc::new(mem.clone()) as Arc<dyn SpanExporter>], BatchConfig::default());
        p.on_end(span("before"));
        p.shutdown().await;
        p.on_end(span("after"));
        assert_eq!(mem.spans().len(), 1);
        assert_eq!(p.dropped_spans(), 1);
    }

    #[tokio::test]
    async fn console_exporter_writes_batch_through_async_stdout() {
        let batch = vec![span("a"), span("b")];
        ConsoleExporter.export(&batch).await.unwrap();
    }

    #[test]
    fn otlp_payload_shape() {
        let mut s = span("login");
        s.parent_span_id = SpanId::from_u64(0xab);
        s.status = SpanStatus::Error("bad".into());
        s.attributes.push(("http.status_code".into(), "401".into()));
        let v = otlp_json("authtrace", &[s.clone()]);
        let rs = &v["resourceSpans"][0];
        assert_eq!(rs["resource"]["attributes"][0]["value"]["stringValue"], "authtrace");
        let out = &rs["scopeSpans"][0]["spans"][0];
        assert_eq!(out["traceId"], s.trace_id.to_string());
        assert_eq!(out["parentSpanId"], "00000000000000ab");
        assert_eq!(out["status"]["code"], 2);
        assert_eq!(out["startTimeUnixNano"], "1");
        assert_eq!(out["attributes"][0]["key"], "http.status_code");
    }

    #[test]
    fn otlp_url_normalized() {
        let e = OtlpHttpExporter::new("http://collector:4318/", "svc").unwrap();
        assert_eq!(e.url(), "http://collector:4318/v1/traces");
    }
}
