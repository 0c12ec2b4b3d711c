//! Typed routing configuration model, loaded from a JSON document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Direction of a route relative to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteDirection {
    #[serde(rename = "INPUT")]
    Input,
    #[serde(rename = "OUTPUT")]
    Output,
}

/// How OUTPUT routes choose a broker partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionStrategy {
    /// Broker default partitioning; no key, no explicit partition.
    #[default]
    None,
    /// Expression computes the record key.
    Key,
    /// Expression computes the partition number directly.
    Expr,
}

/// Policy for one downstream destination of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DestinationConfig {
    /// Scheme-prefixed target: `netty:tcp://host:port`, `kafka:topic`,
    /// `direct:name`.
    pub uri: String,

    /// Retry attempts after the first send (total attempts = maxRetries + 1).
    pub max_retries: u32,

    /// Fixed delay between retry attempts, milliseconds.
    pub retry_delay: u64,

    /// Bound on a single send attempt, milliseconds.
    pub timeout: u64,

    /// Dead-letter topic for this destination; derived from the route and
    /// endpoint when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_topic: Option<String>,

    /// Free-form endpoint parameters, appended to the URI as a query string.
    pub endpoint_parameters: BTreeMap<String, String>,

    /// Accepted for compatibility; dispatch stays sequential regardless.
    pub parallel_processing: bool,

    /// Abort the remaining destinations of the envelope when this one fails
    /// terminally.
    pub stop_on_exception: bool,

    /// FIX message types this destination accepts. Empty, or containing
    /// `"*"`, means all.
    pub msg_types: Vec<String>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            max_retries: 3,
            retry_delay: 1000,
            timeout: 5000,
            dead_letter_topic: None,
            endpoint_parameters: BTreeMap::new(),
            parallel_processing: true,
            stop_on_exception: false,
            msg_types: Vec::new(),
        }
    }
}

impl DestinationConfig {
    pub fn for_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Whether an envelope with this message type may be sent here.
    pub fn matches_msg_type(&self, msg_type: Option<&str>) -> bool {
        if self.msg_types.is_empty() || self.msg_types.iter().any(|t| t == "*") {
            return true;
        }
        match msg_type {
            Some(m) => self.msg_types.iter().any(|t| t == m),
            None => false,
        }
    }

    /// Base URI plus the endpoint parameters as a query string.
    pub fn build_complete_uri(&self) -> String {
        if self.endpoint_parameters.is_empty() {
            return self.uri.clone();
        }
        let mut uri = self.uri.clone();
        uri.push(if self.uri.contains('?') { '&' } else { '?' });
        let mut first = true;
        for (key, value) in &self.endpoint_parameters {
            if !first {
                uri.push('&');
            }
            uri.push_str(key);
            uri.push('=');
            uri.push_str(value);
            first = false;
        }
        uri
    }

    /// Dead-letter topic, falling back to
    /// `dead-letter-<route>-<endpoint>` with both parts slugged.
    pub fn dead_letter_topic_for(&self, route_id: &str) -> String {
        if let Some(topic) = &self.dead_letter_topic {
            if !topic.trim().is_empty() {
                return topic.clone();
            }
        }
        format!("dead-letter-{}-{}", slug(route_id), slug(&self.endpoint_name()))
    }

    /// Short endpoint name for topic naming and logging: the part after the
    /// scheme, query stripped.
    pub fn endpoint_name(&self) -> String {
        let Some((_, rest)) = self.uri.split_once(':') else {
            return self.uri.clone();
        };
        let rest = rest.split('?').next().unwrap_or(rest);
        if rest.is_empty() {
            "unknown".to_string()
        } else {
            rest.to_string()
        }
    }

    pub fn is_netty(&self) -> bool {
        self.uri.contains("netty:")
    }
}

fn slug(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Route-level redelivery policy, applied when a destination aborts the
/// envelope (`stopOnException`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorHandlingConfig {
    pub max_redeliveries: u32,
    pub redelivery_delay: u64,
    pub use_dead_letter_channel: bool,
    pub dead_letter_channel_uri: String,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 1,
            redelivery_delay: 500,
            use_dead_letter_channel: true,
            dead_letter_channel_uri: "direct:deadLetterChannel".to_string(),
        }
    }
}

/// One configured mapping between a broker topic and downstream endpoints.
/// Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteConfig {
    pub route_id: String,

    #[serde(rename = "type")]
    pub direction: RouteDirection,

    pub sender_comp_id: String,
    pub target_comp_id: String,

    /// Legacy plain destination URIs; converted to `destinationConfigs` at
    /// load time.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_topic: Option<String>,

    pub destination_configs: Vec<DestinationConfig>,

    pub error_handling: ErrorHandlingConfig,

    /// OUTPUT routes only.
    pub partition_strategy: PartitionStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_expression: Option<String>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            route_id: String::new(),
            // OUTPUT is the backward-compatible default for documents that
            // omit the field.
            direction: RouteDirection::Output,
            sender_comp_id: String::new(),
            target_comp_id: String::new(),
            destinations: Vec::new(),
            input_topic: None,
            output_topic: None,
            destination_configs: Vec::new(),
            error_handling: ErrorHandlingConfig::default(),
            partition_strategy: PartitionStrategy::None,
            partition_expression: None,
        }
    }
}

impl RouteConfig {
    /// Input topic, auto-derived as `fix.<sender>.<target>.input` when unset.
    pub fn resolved_input_topic(&self) -> String {
        match &self.input_topic {
            Some(topic) if !topic.trim().is_empty() => topic.clone(),
            _ => format!("fix.{}.{}.input", self.sender_comp_id, self.target_comp_id),
        }
    }

    /// Output topic, auto-derived as `fix.<sender>.<target>.output` when
    /// unset.
    pub fn resolved_output_topic(&self) -> String {
        match &self.output_topic {
            Some(topic) if !topic.trim().is_empty() => topic.clone(),
            _ => format!("fix.{}.{}.output", self.sender_comp_id, self.target_comp_id),
        }
    }

    /// Route-specific consumer group id.
    pub fn consumer_group(&self) -> String {
        format!("fix-router-{}", slug(&self.route_id))
    }

    /// Materialise `destination_configs` from the legacy plain URI list when
    /// only that was provided. Converted `netty:` destinations receive the
    /// historical timeout defaults.
    pub fn normalise_destinations(&mut self) {
        if !self.destination_configs.is_empty() || self.destinations.is_empty() {
            return;
        }
        self.destination_configs = self
            .destinations
            .iter()
            .map(|uri| {
                let mut config = DestinationConfig::for_uri(uri.clone());
                if config.is_netty() {
                    config.timeout = 10_000;
                    config
                        .endpoint_parameters
                        .insert("connectTimeout".to_string(), "5000".to_string());
                    config
                        .endpoint_parameters
                        .insert("requestTimeout".to_string(), "5000".to_string());
                }
                config
            })
            .collect();
    }
}

/// Gateway-wide error-handling defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalErrorHandling {
    pub default_max_redeliveries: u32,
    pub default_redelivery_delay: u64,
    pub log_all_errors: bool,
    pub default_dead_letter_topic: String,
}

impl Default for GlobalErrorHandling {
    fn default() -> Self {
        Self {
            default_max_redeliveries: 1,
            default_redelivery_delay: 500,
            log_all_errors: true,
            default_dead_letter_topic: "fix-dead-letter".to_string(),
        }
    }
}

/// The whole routing document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingConfig {
    pub routes: Vec<RouteConfig>,
    pub global_error_handling: GlobalErrorHandling,
    pub default_destination_config: DestinationConfig,
}
