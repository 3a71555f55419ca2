use serde_json::Value;

/// The server's `$vbucket.HLC` virtual attribute.
///
/// This is the clock ATR entries and client records are judged against, so
/// that expiry decisions do not depend on any client's wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHlc {
    pub now_ms: u64,
}

impl ParsedHlc {
    /// Parse `{ "now": "<seconds>", "mode": ... }`. The seconds may carry a
    /// fractional part; digits past milliseconds are dropped.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let now_ms = match value.get("now")? {
            Value::String(s) => parse_seconds(s)?,
            Value::Number(n) => n.as_u64()?.saturating_mul(1000),
            _ => return None,
        };
        Some(Self { now_ms })
    }
}

fn parse_seconds(s: &str) -> Option<u64> {
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    let secs = secs.parse::<u64>().ok()?;
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut millis = 0;
    for b in frac.bytes().chain(std::iter::repeat(b'0')).take(3) {
        millis = millis * 10 + u64::from(b - b'0');
    }
    Some(secs.saturating_mul(1000).saturating_add(millis))
}
