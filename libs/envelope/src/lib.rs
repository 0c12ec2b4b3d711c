//! Canonical in-memory record for a FIX message travelling through the
//! gateway, plus its two accepted wire encodings.
//!
//! On the broker the envelope is always JSON. On ingress a legacy
//! single-line text form (`MessageEnvelope(...)`) is also accepted; see
//! [`text`]. The order-entry convenience fields and the parsed tag map are
//! derived from `raw_message` after decode and never serialised.

pub mod text;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors from envelope decoding.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope JSON decode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid text-form envelope: {0}")]
    TextFormat(String),

    #[error("unrecognised envelope format (expected JSON or MessageEnvelope text form)")]
    UnrecognisedFormat,
}

/// A FIX message plus the routing metadata the gateway carries alongside it.
///
/// Constructed by the input consumer (from a broker payload) or by an output
/// listener (from a raw wire payload), mutated only by the pipeline that
/// created it, and discarded after successful dispatch or dead-letter
/// emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageEnvelope {
    pub session_id: Option<String>,
    pub sender_comp_id: Option<String>,
    pub target_comp_id: Option<String>,
    pub msg_type: Option<String>,
    #[serde(rename = "clOrdID")]
    pub cl_ord_id: Option<String>,

    // Order-entry convenience fields, derived from raw_message. Never on
    // the wire.
    #[serde(skip)]
    pub symbol: Option<String>,
    #[serde(skip)]
    pub side: Option<String>,
    #[serde(skip)]
    pub order_qty: Option<String>,
    #[serde(skip)]
    pub price: Option<String>,

    pub created_timestamp: DateTime<Utc>,

    /// The original FIX payload, SOH delimiters included.
    pub raw_message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_route_id: Option<String>,

    /// Parsed FIX tags for expression evaluation and type filtering.
    /// Populated by [`MessageEnvelope::enrich`]; never serialised.
    #[serde(skip)]
    pub parsed_tags: HashMap<u32, String>,
}

impl Default for MessageEnvelope {
    fn default() -> Self {
        Self {
            session_id: None,
            sender_comp_id: None,
            target_comp_id: None,
            msg_type: None,
            cl_ord_id: None,
            symbol: None,
            side: None,
            order_qty: None,
            price: None,
            created_timestamp: Utc::now(),
            raw_message: String::new(),
            error_message: None,
            error_type: None,
            error_timestamp: None,
            error_route_id: None,
            parsed_tags: HashMap::new(),
        }
    }
}

impl MessageEnvelope {
    /// Envelope around a raw FIX payload, all metadata unset.
    pub fn new(raw_message: impl Into<String>) -> Self {
        Self {
            raw_message: raw_message.into(),
            ..Self::default()
        }
    }

    /// The canonical session identifier for a sender/target pair.
    pub fn session_id_for(sender_comp_id: &str, target_comp_id: &str) -> String {
        format!("FIX.4.4:{sender_comp_id}->{target_comp_id}")
    }

    /// Decode a broker payload: JSON first, the legacy text form second.
    pub fn decode(payload: &str) -> Result<Self, EnvelopeError> {
        match serde_json::from_str::<Self>(payload) {
            Ok(envelope) => Ok(envelope),
            Err(json_error) => {
                if text::is_text_format(payload) {
                    text::parse(payload)
                } else if payload.trim_start().starts_with('{') {
                    Err(EnvelopeError::Json(json_error))
                } else {
                    Err(EnvelopeError::UnrecognisedFormat)
                }
            }
        }
    }

    /// JSON encoding for the broker. Transient fields are suppressed.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Normalise `raw_message`, parse its tags, and fill any unset derived
    /// fields from them.
    ///
    /// Fields already carried on the wire are never overwritten, keeping the
    /// invariant that typed fields and tag values agree.
    pub fn enrich(&mut self) {
        if self.raw_message.is_empty() {
            return;
        }
        self.raw_message = fixwire::process_raw_message(&self.raw_message);
        if !fixwire::is_valid(&self.raw_message) {
            tracing::warn!(session_id = ?self.session_id, "raw message may not be valid FIX");
        }
        let parsed = fixwire::parse_tags(&self.raw_message);

        let fill = |slot: &mut Option<String>, tag: u32| {
            if slot.is_none() {
                *slot = parsed.get(&tag).cloned();
            }
        };
        fill(&mut self.msg_type, fixwire::tags::MSG_TYPE);
        fill(&mut self.cl_ord_id, fixwire::tags::CL_ORD_ID);
        fill(&mut self.symbol, fixwire::tags::SYMBOL);
        fill(&mut self.side, fixwire::tags::SIDE);
        fill(&mut self.order_qty, fixwire::tags::ORDER_QTY);
        fill(&mut self.price, fixwire::tags::PRICE);
        fill(&mut self.sender_comp_id, fixwire::tags::SENDER_COMP_ID);
        fill(&mut self.target_comp_id, fixwire::tags::TARGET_COMP_ID);

        if self.session_id.is_none() {
            if let (Some(sender), Some(target)) = (&self.sender_comp_id, &self.target_comp_id) {
                self.session_id = Some(Self::session_id_for(sender, target));
            }
        }

        self.parsed_tags = parsed;
    }

    /// Stamp the dead-letter error triple.
    pub fn set_error(
        &mut self,
        message: impl Into<String>,
        error_type: impl Into<String>,
        route_id: impl Into<String>,
    ) {
        self.error_message = Some(message.into());
        self.error_type = Some(error_type.into());
        self.error_timestamp = Some(Utc::now());
        self.error_route_id = Some(route_id.into());
    }
}
