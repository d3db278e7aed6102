use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::State,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderValue, StatusCode,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};

use crate::{
    config::RelayConfig,
    error::RelayError,
    models::{AssistantConfig, ChatTurn},
    registry::AssistantRegistry,
    relay::ConversationRelay,
    telemetry,
    upstream::OpenAiAssistants,
};

/** \brief 返回线程 ID 的响应头。 */
pub const THREAD_ID_HEADER: &str = "x-thread-id";

/**
 * \brief 启动 HTTP 服务。
 * \param addr   监听地址，如 "127.0.0.1:5173"
 * \param config 上游与日志配置
 */
pub async fn run(addr: &str, config: &RelayConfig) -> Result<()> {
    let api = OpenAiAssistants::from_config(config)?;
    let registry = AssistantRegistry::new(AssistantConfig::financial(&config.model));
    let relay = ConversationRelay::new(Arc::new(api), Arc::new(registry));

    let app = router(relay);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    telemetry::log_event(
        "server",
        &format!("listening addr={} model={}", addr, config.model),
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 构建路由。/api/chat 与 /chat 共用同一处理函数。
 */
pub fn router(relay: ConversationRelay) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/api/chat", post(chat))
        .route("/api/health", get(health_check))
        .with_state(relay)
}

/**
 * \brief 聊天接口：响应头携带线程 ID，响应体为实时文本流。
 */
async fn chat(
    State(relay): State<ConversationRelay>,
    Json(turn): Json<ChatTurn>,
) -> Result<Response, (StatusCode, String)> {
    let resp = relay.handle(turn).await.map_err(relay_err)?;
    let thread_id = HeaderValue::from_str(&resp.thread_id).map_err(internal_err)?;

    let mut response = Response::new(Body::from_stream(resp.body));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(THREAD_ID_HEADER, thread_id);
    Ok(response)
}

async fn health_check(State(relay): State<ConversationRelay>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "assistant_id": relay.registry().cached(),
    }))
}

fn relay_err(e: RelayError) -> (StatusCode, String) {
    let status = match &e {
        RelayError::MalformedTurn(_) => StatusCode::BAD_REQUEST,
        RelayError::ThreadNotFound(_) => StatusCode::NOT_FOUND,
        RelayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        RelayError::StreamFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    telemetry::log_error("server", &format!("chat rejected status={} {}", status, e));
    (status, e.to_string())
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
