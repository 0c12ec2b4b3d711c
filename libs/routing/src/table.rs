//! Read-only view over the loaded configuration.

use std::collections::BTreeSet;

use crate::model::{DestinationConfig, GlobalErrorHandling, RouteConfig, RouteDirection, RoutingConfig};

/// The route table. Built once at startup and shared read-only by every
/// worker; writes never happen after load.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    config: RoutingConfig,
}

impl RoutingTable {
    pub(crate) fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.config.routes
    }

    pub fn global(&self) -> &GlobalErrorHandling {
        &self.config.global_error_handling
    }

    pub fn default_destination(&self) -> &DestinationConfig {
        &self.config.default_destination_config
    }

    pub fn route_by_id(&self, route_id: &str) -> Option<&RouteConfig> {
        self.config.routes.iter().find(|r| r.route_id == route_id)
    }

    pub fn input_routes(&self) -> impl Iterator<Item = &RouteConfig> {
        self.config
            .routes
            .iter()
            .filter(|r| r.direction == RouteDirection::Input)
    }

    pub fn output_routes(&self) -> impl Iterator<Item = &RouteConfig> {
        self.config
            .routes
            .iter()
            .filter(|r| r.direction == RouteDirection::Output)
    }

    /// Routes whose comp ids match, ignoring case.
    pub fn find_matching(&self, sender_comp_id: &str, target_comp_id: &str) -> Vec<&RouteConfig> {
        self.config
            .routes
            .iter()
            .filter(|route| {
                route.sender_comp_id.eq_ignore_ascii_case(sender_comp_id)
                    && route.target_comp_id.eq_ignore_ascii_case(target_comp_id)
            })
            .collect()
    }

    pub fn has_route_for(&self, sender_comp_id: &str, target_comp_id: &str) -> bool {
        !self.find_matching(sender_comp_id, target_comp_id).is_empty()
    }

    /// Every topic the gateway needs at startup: route input/output topics
    /// plus the global dead-letter topic.
    pub fn required_topics(&self) -> BTreeSet<String> {
        let mut topics = BTreeSet::new();
        for route in &self.config.routes {
            match route.direction {
                RouteDirection::Input => {
                    topics.insert(route.resolved_input_topic());
                }
                RouteDirection::Output => {
                    topics.insert(route.resolved_output_topic());
                }
            }
        }
        topics.insert(self.config.global_error_handling.default_dead_letter_topic.clone());
        topics
    }
}
