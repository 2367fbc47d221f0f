//! HTTP server for the stock chat agent
//!
//! `POST /api/chat` relays the agent's output as it is generated: the agent
//! runs on its own task and pushes fragments into a channel that the
//! response body drains.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{
        header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE},
        HeaderName, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, info_span, warn, Instrument};

use crate::agent::{StockAgent, PLAIN_SYSTEM_PROMPT, SYSTEM_PROMPT};
use crate::checkpoint::InMemoryCheckpointStore;
use crate::config::AppConfig;
use crate::llm::OpenAiCompatClient;
use crate::market_data::YahooFinanceClient;
use crate::models::ChatRequest;
use crate::tools::{create_market_registry, ToolRegistry};
use crate::Result;

/// Written as the last fragment when a run fails mid-stream.
pub const STREAM_ERROR_PREFIX: &str = "\n\n[error] ";

const STREAM_BUFFER: usize = 64;
const RESPONSE_ID_HEADER: &str = "x-response-id";

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

/// Process-wide context, built once at startup and shared by every request.
#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<StockAgent>,
}

/// Which capabilities the agent is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSet {
    MarketData,
    None,
}

/// Wire the model client, checkpoint store and (optionally) market tools.
pub fn build_state(config: &AppConfig, tool_set: ToolSet) -> Result<ApiState> {
    let model = Arc::new(OpenAiCompatClient::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
        config.model.clone(),
        config.http_timeout,
    )?);

    let (registry, system_prompt) = match tool_set {
        ToolSet::MarketData => {
            let provider = Arc::new(YahooFinanceClient::new(
                config.market_data_base_url.clone(),
                config.http_timeout,
            )?);
            (create_market_registry(provider), SYSTEM_PROMPT)
        }
        ToolSet::None => (ToolRegistry::new(), PLAIN_SYSTEM_PROMPT),
    };

    let agent = StockAgent::new(
        model,
        registry,
        Arc::new(InMemoryCheckpointStore::new()),
        system_prompt,
    )
    .with_max_tool_rounds(config.max_tool_rounds);

    Ok(ApiState {
        agent: Arc::new(agent),
    })
}

/// =============================
/// Root & Health Endpoints
/// =============================

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Hello, World!" }))
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let mut tools = state.agent.tool_names();
    tools.sort_unstable();

    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "tools": tools,
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!("Rejected chat request: {}", rejection.body_text());
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ApiResponse::error(rejection.body_text())),
            )
                .into_response();
        }
    };

    info!(
        thread_id = %req.thread_id,
        response_id = %req.response_id,
        prompt_id = %req.prompt.id,
        role = %req.prompt.role,
        "Received chat request"
    );

    let (tx, rx) = mpsc::channel::<String>(STREAM_BUFFER);
    let span = info_span!(
        "chat",
        thread_id = %req.thread_id,
        response_id = %req.response_id
    );
    let response_id = HeaderValue::from_str(&req.response_id).ok();

    let agent = state.agent.clone();
    tokio::spawn(
        async move {
            match agent.run(&req.thread_id, &req.prompt, tx.clone()).await {
                Ok(summary) => info!(fragments = summary.fragments, "Chat stream completed"),
                Err(e) => {
                    error!("Chat stream failed: {}", e);
                    let _ = tx.send(format!("{}{}", STREAM_ERROR_PREFIX, e)).await;
                }
            }
        }
        .instrument(span),
    );

    let stream = ReceiverStream::new(rx).map(|fragment| Ok::<_, Infallible>(Bytes::from(fragment)));
    let mut response = Response::new(Body::from_stream(stream));

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache, no-transform"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Some(response_id) = response_id {
        headers.insert(HeaderName::from_static(RESPONSE_ID_HEADER), response_id);
    }

    response
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(state: ApiState, address: &str) -> Result<()> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(address).await?;

    info!("API Server listening on http://{}", address);

    axum::serve(listener, router).await?;

    Ok(())
}
