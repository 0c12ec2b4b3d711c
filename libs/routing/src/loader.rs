//! Configuration loading, validation, and expression pre-compilation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use expr::ExpressionCache;
use tracing::{info, warn};

use crate::model::{PartitionStrategy, RouteConfig, RoutingConfig};
use crate::table::RoutingTable;
use crate::ConfigError;

/// Environment variable naming the configuration document.
pub const CONFIG_PATH_ENV: &str = "FIX_ROUTING_CONFIG_PATH";

/// Property-style variable some deployment scripts still set; checked after
/// [`CONFIG_PATH_ENV`].
pub const CONFIG_PATH_PROPERTY: &str = "fix.routing.config.path";

/// Packaged default document, used when nothing else is configured.
const PACKAGED_CONFIG: &str = include_str!("../routing-config.json");

/// Load the routing configuration, resolving the source in priority order:
/// explicit path, `FIX_ROUTING_CONFIG_PATH`, `fix.routing.config.path`, and
/// finally the packaged default.
///
/// Every partition expression is pre-compiled into `cache`; a compile
/// failure is logged but not fatal. Structural violations are fatal.
pub fn load(
    explicit_path: Option<&Path>,
    cache: &ExpressionCache,
) -> Result<RoutingTable, ConfigError> {
    let (document, origin) = match resolve_source(explicit_path) {
        Some(path) => {
            info!(path = %path.display(), "loading routing configuration");
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            (text, path.display().to_string())
        }
        None => {
            info!("loading packaged default routing configuration");
            (PACKAGED_CONFIG.to_string(), "<packaged>".to_string())
        }
    };

    let config: RoutingConfig = serde_json::from_str(&document)?;
    let table = build_table(config, cache)?;
    info!(
        origin,
        routes = table.routes().len(),
        "routing configuration loaded"
    );
    Ok(table)
}

/// Parse and validate an in-memory document. Used by tests and by callers
/// that already hold the JSON.
pub fn from_json(document: &str, cache: &ExpressionCache) -> Result<RoutingTable, ConfigError> {
    let config: RoutingConfig = serde_json::from_str(document)?;
    build_table(config, cache)
}

fn resolve_source(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }
    for variable in [CONFIG_PATH_ENV, CONFIG_PATH_PROPERTY] {
        if let Ok(value) = std::env::var(variable) {
            if !value.trim().is_empty() {
                return Some(PathBuf::from(value));
            }
        }
    }
    None
}

fn build_table(
    mut config: RoutingConfig,
    cache: &ExpressionCache,
) -> Result<RoutingTable, ConfigError> {
    for route in &mut config.routes {
        route.normalise_destinations();
    }

    validate(&config)?;
    precompile_expressions(&config, cache);

    for route in &config.routes {
        if route.input_topic.is_none() || route.output_topic.is_none() {
            warn!(
                route_id = route.route_id,
                "route uses auto-generated topic names; consider setting inputTopic/outputTopic explicitly"
            );
        }
        info!(
            route_id = route.route_id,
            sender = route.sender_comp_id,
            target = route.target_comp_id,
            direction = ?route.direction,
            input_topic = route.resolved_input_topic(),
            output_topic = route.resolved_output_topic(),
            destinations = route.destination_configs.len(),
            "configured route"
        );
    }

    Ok(RoutingTable::new(config))
}

fn validate(config: &RoutingConfig) -> Result<(), ConfigError> {
    if config.routes.is_empty() {
        return Err(ConfigError::Invalid("no routes configured".to_string()));
    }

    let mut seen = BTreeSet::new();
    for route in &config.routes {
        validate_route(route)?;
        if !seen.insert(route.route_id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate routeId '{}'",
                route.route_id
            )));
        }
    }
    Ok(())
}

fn validate_route(route: &RouteConfig) -> Result<(), ConfigError> {
    let invalid =
        |message: String| Err(ConfigError::Invalid(message));

    if route.route_id.trim().is_empty() {
        return invalid("route with empty routeId".to_string());
    }
    if route.sender_comp_id.trim().is_empty() || route.target_comp_id.trim().is_empty() {
        return invalid(format!(
            "route '{}' needs senderCompId and targetCompId",
            route.route_id
        ));
    }
    if route.destination_configs.is_empty() {
        return invalid(format!("route '{}' has no destinations", route.route_id));
    }
    for destination in &route.destination_configs {
        if destination.uri.trim().is_empty() {
            return invalid(format!(
                "route '{}' has a destination without a uri",
                route.route_id
            ));
        }
    }
    if route.partition_strategy != PartitionStrategy::None
        && route.direction != crate::model::RouteDirection::Output
    {
        return invalid(format!(
            "route '{}' sets a partition strategy but is not an OUTPUT route",
            route.route_id
        ));
    }
    Ok(())
}

fn precompile_expressions(config: &RoutingConfig, cache: &ExpressionCache) {
    for route in &config.routes {
        let Some(expression) = &route.partition_expression else {
            continue;
        };
        if expression.trim().is_empty() {
            continue;
        }
        if cache.precompile(expression) {
            info!(route_id = route.route_id, expression, "pre-compiled partition expression");
        } else {
            warn!(
                route_id = route.route_id,
                expression, "partition expression failed to compile; route falls back to default partitioning"
            );
        }
    }
}
