//! Process configuration from `AUTHTRACE_*` environment variables. Read once at startup.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_TOKEN_TTL_MINUTES: u64 = 30;
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";
pub const DEFAULT_SERVICE_NAME: &str = "authtrace";

#[derive(Clone)]
pub struct Config {
    pub http_addr: SocketAddr,
    pub signing_secret: Vec<u8>,
    /// True when no secret was configured and one was generated for this process.
    pub secret_generated: bool,
    pub token_ttl: Duration,
    pub otlp_endpoint: Option<String>,
    pub console_spans: bool,
    pub service_name: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("http_addr", &self.http_addr)
            .field("signing_secret", &"<redacted>")
            .field("secret_generated", &self.secret_generated)
            .field("token_ttl", &self.token_ttl)
            .field("otlp_endpoint", &self.otlp_endpoint)
            .field("console_spans", &self.console_spans)
            .field("service_name", &self.service_name)
            .finish()
    }
}

fn parse_bool(name: &str, v: &str) -> Result<bool> {
    match v.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{name}: expected a boolean, got {v:?}"),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string());

        let addr = get("AUTHTRACE_HTTP_ADDR").unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
        let http_addr: SocketAddr = addr.parse().with_context(|| format!("AUTHTRACE_HTTP_ADDR: invalid address {addr:?}"))?;

        let (signing_secret, secret_generated) = match get("AUTHTRACE_SECRET_KEY").filter(|s| !s.is_empty()) {
            Some(s) => (s.into_bytes(), false),
            None => {
                let mut buf = vec![0u8; 32];
                getrandom::getrandom(&mut buf).map_err(|e| anyhow!("generating signing secret: {e}"))?;
                (buf, true)
            }
        };

        let ttl_minutes = match get("AUTHTRACE_TOKEN_TTL_MINUTES") {
            Some(v) => v.parse::<u64>().with_context(|| format!("AUTHTRACE_TOKEN_TTL_MINUTES: not a number: {v:?}"))?,
            None => DEFAULT_TOKEN_TTL_MINUTES,
        };
        if ttl_minutes == 0 {
            bail!("AUTHTRACE_TOKEN_TTL_MINUTES must be greater than zero");
        }
        let ttl_secs = ttl_minutes.checked_mul(60).context("AUTHTRACE_TOKEN_TTL_MINUTES too large")?;

        let otlp_endpoint = match get("AUTHTRACE_OTLP_ENDPOINT") {
            None => Some(DEFAULT_OTLP_ENDPOINT.to_string()),
            Some(v) if v.is_empty() || v.eq_ignore_ascii_case("none") => None,
            Some(v) => Some(v),
        };

        let console_spans = match get("AUTHTRACE_CONSOLE_SPANS") {
            Some(v) => parse_bool("AUTHTRACE_CONSOLE_SPANS", &v)?,
            None => true,
        };

        let service_name = get("AUTHTRACE_SERVICE_NAME")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

        Ok(Config {
            http_addr,
            signing_secret,
            secret_generated,
            token_ttl: Duration::from_secs(ttl_secs),
            otlp_endpoint,
            console_spans,
            service_name,
        })
    }
}
