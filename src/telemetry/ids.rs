//! Trace and span identifiers plus W3C `traceparent` propagation.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Serialize, Serializer};

/// 128-bit trace identifier. Zero is reserved as "invalid" and never generated.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

/// 64-bit span identifier. Zero is reserved as "invalid" and never generated.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

thread_local! {
    static FALLBACK: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(fallback_seed()));
}

fn fallback_seed() -> u64 {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0);
    nanos ^ SEQ.fetch_add(1, Ordering::Relaxed).rotate_left(32) ^ ((std::process::id() as u64) << 16)
}

fn random_bytes<const N: usize>() -> [u8; N] {
    fill_id(getrandom::getrandom)
}

/// Fill an id from `source`. If the OS entropy source fails, ids come from a per-thread seeded
/// generator instead so they stay distinct.
fn fill_id<const N: usize>(source: impl FnOnce(&mut [u8]) -> Result<(), getrandom::Error>) -> [u8; N] {
    static WARNED: AtomicBool = AtomicBool::new(false);
    let mut buf = [0u8; N];
    if let Err(e) = source(&mut buf) {
        if !WARNED.swap(true, Ordering::Relaxed) {
            tracing::error!(target: "telemetry", "entropy source failed, trace ids now come from a seeded generator: {e}");
        }
        FALLBACK.with(|rng| rng.borrow_mut().fill_bytes(&mut buf));
    }
    // an all-zero id is invalid on the wire
    if buf.iter().all(|b| *b == 0) { buf[N - 1] = 1; }
    buf
}

impl TraceId {
    pub fn random() -> Self { TraceId(u128::from_be_bytes(random_bytes::<16>())) }
    pub fn from_u128(v: u128) -> Option<Self> { if v == 0 { None } else { Some(TraceId(v)) } }
    pub fn as_u128(&self) -> u128 { self.0 }

    /// Parse exactly 32 lowercase hex digits.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 || !is_lower_hex(s) { return None; }
        u128::from_str_radix(s, 16).ok().and_then(Self::from_u128)
    }
}

impl SpanId {
    pub fn random() -> Self { SpanId(u64::from_be_bytes(random_bytes::<8>())) }
    pub fn from_u64(v: u64) -> Option<Self> { if v == 0 { None } else { Some(SpanId(v)) } }
    pub fn as_u64(&self) -> u64 { self.0 }

    /// Parse exactly 16 lowercase hex digits.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 || !is_lower_hex(s) { return None; }
        u64::from_str_radix(s, 16).ok().and_then(Self::from_u64)
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:032x}", self.0) }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "TraceId({})", self) }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:016x}", self.0) }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "SpanId({})", self) }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> { s.collect_str(self) }
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> { s.collect_str(self) }
}

/// Remote parent extracted from an inbound `traceparent` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteParent {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub sampled: bool,
}

/// Parse a W3C trace-context `traceparent` value: `vv-<32hex>-<16hex>-<2hex>`.
/// Version `ff` is invalid; unknown future versions are accepted when the first four fields parse.
pub fn parse_traceparent(value: &str) -> Option<RemoteParent> {
    let value = value.trim();
    let mut parts = value.split('-');
    let version = parts.next()?;
    let trace = parts.next()?;
    let span = parts.next()?;
    let flags = parts.next()?;
    if version.len() != 2 || !is_lower_hex(version) || version == "ff" { return None; }
    // version 00 has exactly four fields
    if version == "00" && parts.next().is_some() { return None; }
    if flags.len() != 2 || !is_lower_hex(flags) { return None; }
    let flags = u8::from_str_radix(flags, 16).ok()?;
    Some(RemoteParent {
        trace_id: TraceId::from_hex(trace)?,
        span_id: SpanId::from_hex(span)?,
        sampled: flags & 0x01 == 0x01,
    })
}

/// Render a version 00 `traceparent` header value.
pub fn format_traceparent(trace_id: TraceId, span_id: SpanId, sampled: bool) -> String {
    format!("00-{}-{}-{}", trace_id, span_id, if sampled { "01" } else { "00" })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unavailable(_: &mut [u8]) -> Result<(), getrandom::Error> {
        Err(getrandom::Error::UNSUPPORTED)
    }

    #[test]
    fn failing_entropy_source_still_yields_distinct_ids() {
        let a: [u8; 16] = fill_id(unavailable);
        let b: [u8; 16] = fill_id(unavailable);
        let c: [u8; 8] = fill_id(unavailable);
        assert_ne!(a, b);
        assert!(a.iter().any(|x| *x != 0) && b.iter().any(|x| *x != 0));
        assert_ne!(c, [0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn ids_render_fixed_width_lowercase_hex() {
        let t = TraceId::from_u128(0xabc).unwrap();
        let s = SpanId::from_u64(0x1F).unwrap();
        assert_eq!(t.to_string(), "00000000000000000000000000000abc");
        assert_eq!(s.to_string(), "000000000000001f");
        assert_eq!(TraceId::from_hex(&t.to_string()), Some(t));
        assert_eq!(SpanId::from_hex(&s.to_string()), Some(s));
    }

    #[test]
    fn random_ids_are_nonzero_and_distinct() {
        let a = TraceId::random();
        let b = TraceId::random();
        assert_ne!(a.as_u128(), 0);
        assert_ne!(a, b);
        assert_ne!(SpanId::random().as_u64(), 0);
    }

    #[test]
    fn zero_and_uppercase_ids_rejected() {
        assert!(TraceId::from_hex(&"0".repeat(32)).is_none());
        assert!(SpanId::from_hex(&"0".repeat(16)).is_none());
        assert!(SpanId::from_hex("00000000000000AB").is_none());
        assert!(SpanId::from_hex("abc").is_none());
    }

    #[test]
    fn traceparent_parse() {
        let p = parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").unwrap();
        assert_eq!(p.trace_id.to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(p.span_id.to_string(), "00f067aa0ba902b7");
        assert!(p.sampled);

        let unsampled = parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00").unwrap();
        assert!(!unsampled.sampled);
    }

    #[test]
    fn traceparent_rejects_malformed() {
        assert!(parse_traceparent("").is_none());
        assert!(parse_traceparent("garbage").is_none());
        assert!(parse_traceparent("ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").is_none());
        assert!(parse_traceparent("00-00000000000000000000000000000000-00f067aa0ba902b7-01").is_none());
        assert!(parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01").is_none());
        assert!(parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra").is_none());
        assert!(parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7").is_none());
    }

    #[test]
    fn traceparent_format_round_trips() {
        let t = TraceId::random();
        let s = SpanId::random();
        let p = parse_traceparent(&format_traceparent(t, s, true)).unwrap();
        assert_eq!((p.trace_id, p.span_id, p.sampled), (t, s, true));
        let unsampled = format_traceparent(t, s, false);
        assert!(unsampled.ends_with("-00"));
        assert!(!parse_traceparent(&unsampled).unwrap().sampled);
    }
}
