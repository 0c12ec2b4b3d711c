//! HTTP introspection surface over the routing table.
//!
//! Read-only; serves the route table loaded at startup. `build_router` is
//! the single entry point so tests can drive the bare router.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use routing::{RouteConfig, RoutingTable};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Clone)]
pub struct HttpState {
    pub table: Arc<RoutingTable>,
}

pub fn build_router(table: Arc<RoutingTable>) -> Router {
    Router::new()
        .route("/api/routing/routes", get(routes))
        .route("/api/routing/match", get(match_routes))
        .route("/api/routing/health", get(health))
        .route("/api/routing/config", get(config))
        .with_state(HttpState { table })
}

async fn routes(State(state): State<HttpState>) -> Json<Vec<RouteConfig>> {
    Json(state.table.routes().to_vec())
}

#[derive(Debug, Deserialize)]
struct MatchQuery {
    #[serde(rename = "senderCompId")]
    sender_comp_id: String,
    #[serde(rename = "targetCompId")]
    target_comp_id: String,
}

async fn match_routes(
    State(state): State<HttpState>,
    Query(query): Query<MatchQuery>,
) -> Json<Value> {
    let matching = state
        .table
        .find_matching(&query.sender_comp_id, &query.target_comp_id);
    let destinations: Vec<String> = matching
        .iter()
        .flat_map(|route| route.destination_configs.iter())
        .map(|destination| destination.build_complete_uri())
        .collect();

    Json(json!({
        "senderCompId": query.sender_comp_id,
        "targetCompId": query.target_comp_id,
        "matchingRoutes": matching,
        "destinations": destinations,
        "hasRoute": !matching.is_empty(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "UP",
        "service": "fix-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn config(State(state): State<HttpState>) -> Json<Value> {
    Json(json!({
        "totalRoutes": state.table.routes().len(),
        "routes": state.table.routes(),
    }))
}
