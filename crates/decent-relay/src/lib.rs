//! Decent signaling relay.
//!
//! Hands every WebSocket connection a session id and forwards call
//! handshakes between ids. Once two peers have exchanged offer and answer
//! they talk directly and the relay never sees their traffic.

#![forbid(unsafe_code)]

pub mod config;
pub mod registry;
pub mod signal;

use std::net::SocketAddr;

use axum::{
    extract::State,
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::RelayConfig;
pub use registry::{Forward, Registry};

#[derive(Clone, Default)]
pub struct AppState {
    pub registry: Registry,
    pub config: RelayConfig,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Registry::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct Health {
    connected_clients: usize,
}

async fn liveness() -> &'static str {
    "Server is running."
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(Health {
        connected_clients: state.registry.len().await,
    })
}

// Any origin may open the signaling socket.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST])
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/health", get(health))
        .route("/ws", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
        .with_state(state)
}

/// Serve the relay on an already bound listener until the server stops.
pub async fn serve(listener: TcpListener, state: AppState) -> decent_common::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
