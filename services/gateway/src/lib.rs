//! FIX message gateway: routing engine between a log-based broker and FIX
//! endpoints.
//!
//! INPUT routes consume envelopes from a broker topic and dispatch the raw
//! FIX payload to downstream endpoints with per-destination retry and
//! dead-lettering. OUTPUT routes listen on endpoints for inbound FIX
//! payloads, wrap them in envelopes, apply the partition strategy, and
//! publish to a broker topic. The [`supervisor::Supervisor`] owns
//! construction and lifecycle of everything.

pub mod broker;
pub mod consumer;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod listener;
pub mod output;
pub mod supervisor;
pub mod test_utils;

pub use error::GatewayError;
