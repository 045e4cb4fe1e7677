//! Chat route group, mounted under `/api/chat`.
//!
//! - `GET /models`: static model catalogue
//! - `POST /completion`: validated relay to the LLM provider, JSON or SSE
//! - `GET|DELETE /history`: placeholders; no conversation store exists

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{LlmConfig, ModelInfo};
use crate::error::ApiError;
use crate::identity::AuthenticatedIdentity;
use crate::llm::{ChatMessage, CompletionRequest};
use crate::server::extract::JsonOrForm;
use crate::server::routes::AppState;
use crate::server::streaming::sse_response;
use crate::server::timestamp;
use crate::server::validation::{ChatRequest, RawChatRequest};

const DEFAULT_HISTORY_LIMIT: u32 = 50;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/completion", post(completion))
        .route("/history", get(history).delete(clear_history))
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Non-streaming completion response.
#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub response: String,
    pub model: String,
    pub tokens: u64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub offset: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub chats: Vec<ConversationRecord>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

/// What a conversation store would keep for one exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub user_id: String,
    pub message: String,
    pub model: String,
    pub timestamp: String,
    pub origin: Option<String>,
}

// ─── Parameter Resolution ──────────────────────────────────────────────────

/// Fill in defaults and build the two-message upstream conversation.
pub fn resolve_completion(config: &LlmConfig, request: &ChatRequest) -> CompletionRequest {
    let system_prompt = request
        .system_prompt
        .clone()
        .unwrap_or_else(|| config.system_prompt.clone());

    CompletionRequest {
        model: request
            .model
            .clone()
            .unwrap_or_else(|| config.default_model.clone()),
        messages: vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(request.message.clone()),
        ],
        temperature: request.temperature.unwrap_or(config.default_temperature),
        max_tokens: request.max_tokens.unwrap_or(config.default_max_tokens),
    }
}

/// Caller address: first `X-Forwarded-For` hop, else the peer address.
fn origin_address(
    headers: &HeaderMap,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|Extension(ConnectInfo(addr))| addr.ip().to_string()))
}

/// Lenient integer parse: anything unparseable falls back to the default.
fn parse_or(value: Option<&str>, default: u32) -> u32 {
    value
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList {
        models: state.config.llm.models.clone(),
    })
}

async fn completion(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AuthenticatedIdentity>,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    JsonOrForm(raw): JsonOrForm<RawChatRequest>,
) -> Result<Response, ApiError> {
    let request = raw.validate().map_err(ApiError::Validation)?;
    let upstream = resolve_completion(&state.config.llm, &request);
    let request_id = Uuid::new_v4().to_string();

    info!(
        request_id = %request_id,
        uid = %identity.uid,
        model = %upstream.model,
        max_tokens = upstream.max_tokens,
        stream = request.stream,
        "Chat completion request"
    );

    // Assembled for a future store; only logged for now.
    let record = ConversationRecord {
        user_id: identity.uid.clone(),
        message: request.message.clone(),
        model: upstream.model.clone(),
        timestamp: timestamp(),
        origin: origin_address(&headers, peer),
    };

    if request.stream {
        let fragments = state.llm.complete_stream(&upstream).await?;
        debug!(?record, "Conversation not persisted");
        return Ok(sse_response(fragments, request_id));
    }

    let completion = state.llm.complete(&upstream).await?;
    debug!(?record, "Conversation not persisted");

    info!(
        request_id = %request_id,
        tokens = completion.total_tokens,
        "Chat completion complete"
    );

    Ok(Json(CompletionResponse {
        response: completion.content,
        model: upstream.model,
        tokens: completion.total_tokens,
        timestamp: timestamp(),
    })
    .into_response())
}

async fn history(
    Extension(identity): Extension<AuthenticatedIdentity>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    debug!(uid = %identity.uid, "History requested; no store configured");
    Json(HistoryResponse {
        chats: Vec::new(),
        total: 0,
        limit: parse_or(query.limit.as_deref(), DEFAULT_HISTORY_LIMIT),
        offset: parse_or(query.offset.as_deref(), 0),
    })
}

async fn clear_history(Extension(identity): Extension<AuthenticatedIdentity>) -> Json<Ack> {
    debug!(uid = %identity.uid, "History clear requested; no store configured");
    Json(Ack {
        success: true,
        message: "Chat history cleared".to_string(),
    })
}
