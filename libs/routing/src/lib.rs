//! Routing configuration: typed route table with destination policies,
//! partitioning, and error-handling knobs, loaded once from a JSON document.

mod loader;
mod model;
mod table;

use std::path::PathBuf;

pub use loader::{from_json, load, CONFIG_PATH_ENV, CONFIG_PATH_PROPERTY};
pub use model::{
    DestinationConfig, ErrorHandlingConfig, GlobalErrorHandling, PartitionStrategy, RouteConfig,
    RouteDirection, RoutingConfig,
};
pub use table::RoutingTable;

/// Fatal configuration problems; the process exits non-zero on any of these.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse routing configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid routing configuration: {0}")]
    Invalid(String),
}
