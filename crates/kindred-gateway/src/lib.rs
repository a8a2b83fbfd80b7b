//! The relay: a shared broker that fans invalidation and ephemeral events
//! out to the live sessions of a username. It holds no durable state.

pub mod connection;
pub mod dispatcher;
pub mod registry;

use axum::{Json, Router, extract::State, routing::get};

use kindred_types::api::HealthResponse;

use crate::dispatcher::Dispatcher;

/// Relay routes: `GET /` health and `GET /gateway` WebSocket upgrade.
pub fn routes(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/gateway", get(connection::ws_upgrade))
        .with_state(dispatcher)
}

async fn health(State(dispatcher): State<Dispatcher>) -> Json<HealthResponse> {
    let (connections, users) = dispatcher.stats().await;
    Json(HealthResponse {
        status: "This server is working!".to_string(),
        connections,
        users,
    })
}
