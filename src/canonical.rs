//! Request parameter canonicalization and secret redaction.
//!
//! Small, free-function utility module producing a deterministic
//! serialization of a request's query parameters, plus a redacted
//! rendering for logs.

use std::collections::BTreeMap;

/// Parameter names that must never appear in logs or redacted URL renderings
/// with their value intact.
const SENSITIVE_PARAM_NAMES: &[&str] = &[
    "token",
    "apikey",
    "api_key",
    "authorization",
    "refresh_token",
    "cookie",
    "access_token",
    "secret",
    "client_secret",
    "password",
];

/// Canonicalizes a multi-valued query parameter set into a deterministic
/// string, independent of input ordering.
///
/// Rules (bit-exact — pinned by tests):
/// - Pairs are grouped by key.
/// - Values within a key are sorted by ordinal byte order and joined with a
///   literal comma.
/// - Groups are emitted sorted by key.
/// - Both sides are percent-encoded with lowercase hex; space encodes as
///   `%20` (never `+`); the joining comma is itself percent-encoded as `%2c`.
/// - Empty input canonicalizes to `""`.
pub fn canonicalize<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (key, value) in pairs {
        grouped.entry(key).or_default().push(value);
    }

    let mut parts = Vec::with_capacity(grouped.len());
    for (key, mut values) in grouped {
        values.sort_unstable();
        let joined = values.join(",");
        parts.push(format!(
            "{}={}",
            percent_encode(key),
            percent_encode(&joined)
        ));
    }

    parts.join("&")
}

/// Percent-encodes `input` with lowercase hex digits, encoding space as
/// `%20` and `,` as `%2c` (the comma is only ever present here as the
/// multi-value separator inserted by [`canonicalize`], so it is always
/// encoded, never left literal).
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{:02x}", byte));
            }
        }
    }
    out
}

/// Produces a redacted rendering of a query string suitable for logging:
/// sensitive keys (matched against [`SENSITIVE_PARAM_NAMES`]) render as
/// `[redacted]`; every key name is preserved so cardinality stays visible
/// without leaking secret values.
pub fn redact_for_log<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parts = Vec::new();
    for (key, value) in pairs {
        let lower = key.to_ascii_lowercase();
        let rendered = if SENSITIVE_PARAM_NAMES
            .iter()
            .any(|sensitive| lower.contains(sensitive))
        {
            "[redacted]"
        } else {
            value
        };
        parts.push(format!("{key}={rendered}"));
    }
    parts.join("&")
}
