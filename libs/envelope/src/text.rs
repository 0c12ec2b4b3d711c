//! Legacy single-line text form of the envelope.
//!
//! Upstream tooling occasionally publishes envelopes as
//! `MessageEnvelope(sessionId=…, senderCompId=…, targetCompId=…, msgType=…,
//! createdTimestamp=…, rawMessage=…, errorMessage=…)`. The `rawMessage`
//! value is taken verbatim — a trailing SOH must survive the round trip —
//! and an unparseable timestamp falls back to "now".

use chrono::{DateTime, Utc};

use crate::{EnvelopeError, MessageEnvelope};

const PREFIX: &str = "MessageEnvelope(";

/// Cheap check used to pick the decode path.
pub fn is_text_format(input: &str) -> bool {
    input.trim_start().starts_with(PREFIX)
}

/// Parse the text form into an envelope.
///
/// `sessionId`, `senderCompId`, `targetCompId` and `msgType` are required;
/// values other than `rawMessage` are trimmed. `errorMessage` is always the
/// final pair and may contain commas.
pub fn parse(input: &str) -> Result<MessageEnvelope, EnvelopeError> {
    let trimmed = input.trim();
    let inner = trimmed
        .strip_prefix(PREFIX)
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| {
            EnvelopeError::TextFormat("missing MessageEnvelope(...) wrapper".to_string())
        })?;

    let mut envelope = MessageEnvelope::default();
    let mut saw_raw_message = false;

    let mut rest = inner;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim_matches(|c: char| c == ',' || c.is_whitespace());
        let value_and_rest = &rest[eq + 1..];

        let value: &str;
        if key == "errorMessage" {
            // Final pair; the message may itself contain commas.
            value = value_and_rest;
            rest = "";
        } else if let Some(comma) = value_and_rest.find(',') {
            value = &value_and_rest[..comma];
            rest = &value_and_rest[comma + 1..];
        } else {
            value = value_and_rest;
            rest = "";
        }

        match key {
            "sessionId" => envelope.session_id = non_null(value),
            "senderCompId" => envelope.sender_comp_id = non_null(value),
            "targetCompId" => envelope.target_comp_id = non_null(value),
            "msgType" => envelope.msg_type = non_null(value),
            "clOrdID" => envelope.cl_ord_id = non_null(value),
            "createdTimestamp" => envelope.created_timestamp = parse_timestamp(value.trim()),
            // Verbatim: trailing SOH and embedded `=` must be preserved.
            "rawMessage" => {
                envelope.raw_message = value.to_string();
                saw_raw_message = true;
            }
            "errorMessage" => envelope.error_message = non_null(value),
            _ => {}
        }
    }

    for (name, present) in [
        ("sessionId", envelope.session_id.is_some()),
        ("senderCompId", envelope.sender_comp_id.is_some()),
        ("targetCompId", envelope.target_comp_id.is_some()),
        ("msgType", envelope.msg_type.is_some()),
        ("rawMessage", saw_raw_message),
    ] {
        if !present {
            return Err(EnvelopeError::TextFormat(format!("missing key '{name}'")));
        }
    }

    Ok(envelope)
}

fn non_null(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "null" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(_) => {
            tracing::debug!(value, "unparseable createdTimestamp, falling back to now");
            Utc::now()
        }
    }
}
