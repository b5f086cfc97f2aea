//!
//! authtrace HTTP server
//! ----------------------
//! Axum HTTP API for signup, login and profile lookup.
//!
//! Responsibilities:
//! - One correlation context and one server span per request (`correlate` middleware), inherited
//!   from an inbound `traceparent` header when present and echoed back on the response.
//! - A named child span around each handler.
//! - A store session acquired per request and released on every exit path.
//! - Argon2 work on the blocking pool, still correlated.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::FutureExt; // for catch_unwind on async blocks
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::identity::{resolve, AuthError, AuthProvider, LocalAuthProvider, LoginRequest, LoginResponse, Principal, SignupRequest, TokenService};
use crate::security::CredentialVerifier;
use crate::storage::SharedStore;
use crate::telemetry::correlation::{self, CorrelationContext, WithCorrelation};
use crate::telemetry::{
    format_traceparent, parse_traceparent, BatchConfig, BatchSpanProcessor, ConsoleExporter, OtlpHttpExporter,
    SpanExporter, SpanKind, Tracer,
};

pub const TRACEPARENT: HeaderName = HeaderName::from_static("traceparent");

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub provider: Arc<LocalAuthProvider>,
    pub tracer: Tracer,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(read_root))
        .route("/signup", post(signup))
        .route("/signup/", post(signup))
        .route("/login", post(login))
        .route("/login/", post(login))
        .route("/users/me", get(read_me))
        .route("/users/me/", get(read_me))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), correlate))
        .with_state(state)
}

/// Begin the request's correlation context, run the rest of the stack inside it, end it.
///
/// The context is only active while the inner future is being polled, so it is torn down when
/// the request completes, fails, panics, or is dropped because the client went away.
async fn correlate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let parent = req
        .headers()
        .get(&TRACEPARENT)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_traceparent)
        .map(|p| CorrelationContext::new(p.trace_id, p.span_id).with_sampled(p.sampled));
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    let mut span = state.tracer.start_span_with_parent(format!("{method} {path}"), parent, SpanKind::Server);
    span.set_attribute("http.method", &method);
    span.set_attribute("http.target", &path);
    let ctx = span.context();

    // the span lives inside the correlated future so closing it, or dropping it when the client
    // goes away, is logged under the request's own ids
    let mut resp = async move {
        info!(target: "http", method = %method, path = %path, "request started");
        let resp = match AssertUnwindSafe(next.run(req)).catch_unwind().await {
            Ok(r) => r,
            Err(_) => {
                error!(target: "http", "handler panicked");
                AppError::from(AuthError::Internal("handler panicked".into())).into_response()
            }
        };
        let status = resp.status();
        info!(target: "http", status = status.as_u16(), "request finished");
        span.set_attribute("http.status_code", status.as_u16());
        if status.is_server_error() {
            span.close_with_error(status.to_string());
        } else {
            span.close();
        }
        resp
    }
    .with_correlation(ctx)
    .await;

    if let Ok(v) = HeaderValue::from_str(&format_traceparent(ctx.trace_id, ctx.span_id, ctx.sampled)) {
        resp.headers_mut().insert(TRACEPARENT, v);
    }
    resp
}

/// Log the internal reason, hand back the collapsed boundary error.
fn reject(e: AuthError) -> AppError {
    if e.is_unauthorized() || e == AuthError::DuplicateIdentity {
        warn!(target: "auth", reason = e.kind(), "request rejected");
    } else {
        error!(target: "auth", reason = e.kind(), "request failed: {e}");
    }
    AppError::from(e)
}

async fn read_root(State(state): State<AppState>) -> AppResult<Json<Value>> {
    state.tracer.in_span("read_root_span", async {
        info!("received request for root endpoint");
        Ok::<_, AppError>(Json(json!({ "message": "Hello, observability world!" })))
    }).await
}

async fn signup(State(state): State<AppState>, Json(payload): Json<SignupRequest>) -> AppResult<Json<Principal>> {
    let tracer = state.tracer.clone();
    tracer.in_span("create_user_span", async move {
        let session = state.store.session();
        let provider = state.provider.clone();
        let principal = correlation::spawn_blocking(move || provider.signup(&*session, &payload))
            .await
            .map_err(|e| anyhow!("signup task: {e}"))?
            .map_err(reject)?;
        Ok::<_, AppError>(Json(principal))
    }).await
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> AppResult<Json<LoginResponse>> {
    let tracer = state.tracer.clone();
    tracer.in_span("login_span", async move {
        let session = state.store.session();
        let provider = state.provider.clone();
        let resp = correlation::spawn_blocking(move || provider.login(&*session, &payload))
            .await
            .map_err(|e| anyhow!("login task: {e}"))?
            .map_err(reject)?;
        Ok::<_, AppError>(Json(resp))
    }).await
}

async fn read_me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Principal>> {
    state.tracer.in_span("get_current_user_span", async {
        let session = state.store.session();
        let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
        let principal = resolve(state.provider.tokens(), &*session, authorization).map_err(reject)?;
        info!(target: "auth", email = %principal.identity, "fetching profile for user");
        Ok::<_, AppError>(Json(principal))
    }).await
}

async fn not_found() -> AppError {
    AppError::not_found("not_found", "Not Found")
}

/// Build exporters and the tracer from config. Needs a running tokio runtime.
pub fn build_tracer(config: &Config) -> anyhow::Result<Tracer> {
    let mut exporters: Vec<Arc<dyn SpanExporter>> = Vec::new();
    if let Some(endpoint) = &config.otlp_endpoint {
        let otlp = OtlpHttpExporter::new(endpoint, &config.service_name)?;
        info!(target: "startup", url = otlp.url(), "exporting spans over OTLP/HTTP");
        exporters.push(Arc::new(otlp));
    }
    if config.console_spans {
        exporters.push(Arc::new(ConsoleExporter));
    }
    if exporters.is_empty() {
        info!(target: "startup", "span export disabled");
        return Ok(Tracer::disabled());
    }
    Ok(Tracer::new(BatchSpanProcessor::spawn(exporters, BatchConfig::default())))
}

pub fn build_state(config: &Config, store: SharedStore, tracer: Tracer) -> anyhow::Result<AppState> {
    if config.secret_generated {
        warn!(target: "startup", "AUTHTRACE_SECRET_KEY not set; using a random key, tokens will not survive a restart");
    }
    let tokens = Arc::new(TokenService::new(&config.signing_secret, config.token_ttl));
    let verifier = CredentialVerifier::new().context("initializing credential verifier")?;
    Ok(AppState { store, provider: Arc::new(LocalAuthProvider::new(verifier, tokens)), tracer })
}

/// Serve until Ctrl-C, then flush pending spans.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let tracer = build_tracer(&config)?;
    let (store, _mem) = SharedStore::in_memory();
    let state = build_state(&config, store, tracer.clone())?;

    let addr: SocketAddr = config.http_addr;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracer.shutdown().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
