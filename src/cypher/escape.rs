//! Literal rendering for generated Cypher
//!
//! Statements are shipped as text, so every literal goes through here.
//! Output never depends on the process locale.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write;

/// Escape a string for use inside a single-quoted Cypher literal
pub fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Quoted string literal
pub fn quote(s: &str) -> String {
    format!("'{}'", escape_string(s))
}

/// Shortest round-trip rendering, always with a decimal point.
/// Non-finite values have no Cypher literal and become `null`.
pub fn format_float(v: f64) -> String {
    if !v.is_finite() {
        return "null".to_string();
    }
    let s = v.to_string();
    if s.contains('.') || s.contains('e') || s.contains('E') {
        s
    } else {
        format!("{}.0", s)
    }
}

/// `datetime('…Z')` literal with millisecond precision
pub fn format_datetime(t: &DateTime<Utc>) -> String {
    format!(
        "datetime('{}')",
        t.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}
