//! HTTP 入口
//!
//! 每种入站方言一个 handler；错误体按调用方的方言构造。

pub mod auth;
pub mod error;
pub mod messages;
pub mod openai;

use crate::protocol::ByteStream;
use crate::proxy::ProxyForwarder;
use crate::rate_limit::RateLimiter;
use crate::router::Router;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderValue, Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub proxy: Arc<ProxyForwarder>,
    pub rate_limiter: Arc<RateLimiter>,
    /// 为空时不鉴权
    pub api_keys: Arc<Vec<String>>,
    pub small_fast_model: Option<String>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn build_router(state: AppState) -> AxumRouter {
    let api = AxumRouter::new()
        .route("/v1/messages", post(messages::handle_messages))
        .route("/v1/chat/completions", post(openai::handle_chat_completions))
        .route("/chat/completions", post(openai::handle_chat_completions))
        .route("/v1/responses", post(openai::handle_responses))
        .route("/responses", post(openai::handle_responses))
        .route("/v1/models", get(openai::handle_models))
        .route("/models", get(openai::handle_models))
        .route("/v1/embeddings", post(openai::handle_embeddings))
        .route("/embeddings", post(openai::handle_embeddings))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    AxumRouter::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .merge(api)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                // 过滤掉健康检查的日志
                if request.uri().path() == "/health" {
                    tracing::trace_span!("health_check")
                } else {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }
            }),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Response {
    Json(json!({ "status": "healthy" })).into_response()
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// SSE 响应，带上禁止缓冲的响应头
pub fn sse_response(stream: ByteStream) -> Response {
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    // 禁用 nginx 缓冲
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// 上游 JSON 响应体原样返回
pub fn raw_json_response(body: Bytes) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}
