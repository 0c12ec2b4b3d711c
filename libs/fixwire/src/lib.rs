//! FIX wire-format helpers.
//!
//! The gateway treats FIX payloads as opaque framed text. This crate is the
//! single place that interprets tag/value structure (notably tag 35 as the
//! routing message type) and normalises raw payloads before they travel
//! further. No I/O happens here.

pub mod tags;

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::debug;

pub use tags::SOH;

/// Split a raw FIX payload on SOH into a tag -> value map.
///
/// Malformed fields (no `=`, empty or non-numeric tag) are skipped silently.
/// Repeated tags keep the last value seen; a repeat is noted at debug level.
pub fn parse_tags(raw: &str) -> HashMap<u32, String> {
    let mut parsed = HashMap::new();
    if raw.is_empty() {
        return parsed;
    }

    for field in raw.split(SOH) {
        if field.is_empty() {
            continue;
        }
        let Some(eq) = field.find('=') else {
            continue;
        };
        if eq == 0 {
            continue;
        }
        let Ok(tag) = field[..eq].parse::<u32>() else {
            debug!(field, "skipping FIX field with non-numeric tag");
            continue;
        };
        let value = &field[eq + 1..];
        if let Some(previous) = parsed.insert(tag, value.to_string()) {
            debug!(tag, %previous, "duplicate FIX tag, keeping last value");
        }
    }

    parsed
}

/// Append a trailing SOH iff the payload is non-empty and does not already
/// end with one.
pub fn ensure_trailing_soh(raw: &str) -> Cow<'_, str> {
    if raw.is_empty() || raw.ends_with(SOH) {
        return Cow::Borrowed(raw);
    }
    let mut owned = String::with_capacity(raw.len() + 1);
    owned.push_str(raw);
    owned.push(SOH);
    Cow::Owned(owned)
}

/// Replace literal six-character `\uXXXX` escape sequences with their code
/// point.
///
/// On a malformed escape the backslash is kept in place and scanning resumes
/// at the next character.
pub fn unescape_unicode(raw: &str) -> Cow<'_, str> {
    if !raw.contains("\\u") {
        return Cow::Borrowed(raw);
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let bytes = tail.as_bytes();
        if bytes.len() >= 6 && bytes[1] == b'u' && bytes[2..6].iter().all(u8::is_ascii_hexdigit) {
            if let Some(ch) = u32::from_str_radix(&tail[2..6], 16)
                .ok()
                .and_then(char::from_u32)
            {
                out.push(ch);
                rest = &tail[6..];
                continue;
            }
        }
        out.push('\\');
        rest = &tail[1..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Normalise a raw payload that may carry escape sequences: unescape
/// `\uXXXX` first, then guarantee the trailing SOH.
pub fn process_raw_message(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let unescaped = unescape_unicode(raw);
    ensure_trailing_soh(&unescaped).into_owned()
}

/// Number of SOH delimiters in the payload.
pub fn count_soh(raw: &str) -> usize {
    raw.bytes().filter(|&b| b == 0x01).count()
}

/// Basic structural validity: starts with `8=FIX` and contains at least one
/// SOH delimiter.
pub fn is_valid(raw: &str) -> bool {
    raw.starts_with("8=FIX") && count_soh(raw) > 0
}
