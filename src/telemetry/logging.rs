//! Log formatting that stamps every line with the active correlation ids.

use std::fmt;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use super::correlation;

/// `<timestamp> - <target> - <LEVEL> - <message> - trace_id=<hex> - span_id=<hex>`
///
/// The ids are read from the correlation slot when the event is formatted, which happens
/// synchronously on the emitting thread. Outside of any request both render as `0`.
#[derive(Debug, Clone, Default)]
pub struct CorrelatedFormat;

impl<S, N> FormatEvent<S, N> for CorrelatedFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let meta = event.metadata();
        write!(
            writer,
            "{} - {} - {} - ",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            meta.target(),
            meta.level()
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        match correlation::current() {
            Some(c) => writeln!(writer, " - trace_id={} - span_id={}", c.trace_id, c.span_id),
            None => writeln!(writer, " - trace_id=0 - span_id=0"),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(CorrelatedFormat)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}
