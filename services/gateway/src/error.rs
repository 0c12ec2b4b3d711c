//! Gateway-level error taxonomy.

use crate::broker::BrokerError;
use crate::endpoint::EndpointError;

/// Case-insensitive tokens that mark an error as network-related and
/// therefore retryable.
pub const NETWORK_ERROR_TOKENS: [&str; 7] = [
    "connection",
    "timeout",
    "network",
    "socket",
    "io",
    "connect",
    "refused",
];

/// Token scan over an error's rendered text, used where no typed
/// classification exists.
pub fn looks_like_network_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    NETWORK_ERROR_TOKENS.iter().any(|token| lower.contains(token))
}

/// Errors that abort startup or the supervisor; all exit the process
/// non-zero.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] routing::ConfigError),

    #[error("supervisor error: {0}")]
    Supervisor(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
