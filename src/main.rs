use tracing::info;

use authtrace::config::Config;
use authtrace::telemetry::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    logging::init("info")?;

    let config = Config::from_env()?;
    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "authtrace",
        "authtrace starting: RUST_LOG='{}', http_addr={}, token_ttl_secs={}, otlp={:?}, console_spans={}, service={}",
        rust_log,
        config.http_addr,
        config.token_ttl.as_secs(),
        config.otlp_endpoint,
        config.console_spans,
        config.service_name
    );

    authtrace::server::run(config).await
}
