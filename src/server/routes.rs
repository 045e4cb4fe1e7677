//! Router assembly, shared state and the unauthenticated routes.
//!
//! - GET /
//! - GET /health
//! - /api/chat/* (bearer token required)
//! - /api/auth/* (bearer token required)
//! - anything else: JSON 404

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, OriginalUri, State};
use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::identity::{require_identity, IdentityProvider};
use crate::llm::ChatBackend;
use crate::server::middleware::{cors_layer, security_headers, PanicResponder};
use crate::server::{chat, profile, timestamp};

/// Paths advertised by the 404 response.
pub const AVAILABLE_ROUTES: [&str; 4] = ["/", "/health", "/api/chat", "/api/auth"];

/// Application state shared across handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub identity: Arc<dyn IdentityProvider>,
    pub llm: Arc<dyn ChatBackend>,
    pub start_time: Instant,
}

/// Build the axum router with all routes and layers.
pub fn build_router(state: Arc<AppState>) -> Router {
    let config = state.config.clone();
    let server = &config.server;
    let gate = from_fn_with_state(state.identity.clone(), require_identity);

    // Layers run outermost-last: trace, concurrency, headers, CORS, body limit, panic catcher.
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .nest("/api/chat", chat::router().route_layer(gate.clone()))
        .nest("/api/auth", profile::router().route_layer(gate))
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(PanicResponder {
            expose_details: server.expose_error_details,
        }))
        .layer(DefaultBodyLimit::max(server.body_limit_bytes))
        .layer(cors_layer(server))
        .layer(from_fn(security_headers))
        .layer(GlobalConcurrencyLimitLayer::new(server.max_concurrent_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Response Types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Endpoints {
    pub chat: &'static str,
    pub auth: &'static str,
    pub health: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Banner {
    pub message: String,
    pub endpoints: Endpoints,
    pub timestamp: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub uptime_secs: u64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct RouteNotFound {
    pub error: &'static str,
    pub requested: String,
    pub available: [&'static str; 4],
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn banner(State(state): State<Arc<AppState>>) -> Json<Banner> {
    Json(Banner {
        message: format!("{} backend is running", state.config.server.service_name),
        endpoints: Endpoints {
            chat: "POST /api/chat/completion",
            auth: "GET /api/auth/profile",
            health: "GET /health",
        },
        timestamp: timestamp(),
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
        service: state.config.server.service_name.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        timestamp: timestamp(),
    })
}

async fn not_found(OriginalUri(uri): OriginalUri) -> impl IntoResponse {
    let requested = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    (
        StatusCode::NOT_FOUND,
        Json(RouteNotFound {
            error: "Route not found",
            requested,
            available: AVAILABLE_ROUTES,
        }),
    )
}
