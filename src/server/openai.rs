//! OpenAI 方言入站：Chat Completions / Responses 直接转发，附带请求整形

use super::{error::error_response, raw_json_response, sse_response, AppState};
use crate::error::{Error, Result};
use crate::models::{ClientProtocol, ModelInfo, RequestOptions, UpstreamEndpoint};
use crate::preprocess;
use crate::protocol::detector::ProtocolDetector;
use crate::router::ensure_responses_supported;
use crate::stream;
use crate::telemetry;
use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

pub async fn handle_chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    match chat_completions(&state, body).await {
        Ok(response) => response,
        Err(e) => error_response(ClientProtocol::ChatCompletions, &e),
    }
}

async fn chat_completions(state: &AppState, body: Bytes) -> Result<Response> {
    state.rate_limiter.check().await?;

    let mut payload = parse_object(&body)?;
    let model_id = model_id(&payload);
    let model = state.router.lookup(&model_id);
    preprocess::chat::fill_max_tokens(&mut payload, model.as_deref());
    telemetry::record_request(ClientProtocol::ChatCompletions, UpstreamEndpoint::ChatCompletions);

    let options = preprocess::chat::request_options(&payload);
    forward(state, UpstreamEndpoint::ChatCompletions, &payload, &options).await
}

pub async fn handle_responses(State(state): State<AppState>, body: Bytes) -> Response {
    match responses(&state, body).await {
        Ok(response) => response,
        Err(e) => error_response(ClientProtocol::Responses, &e),
    }
}

async fn responses(state: &AppState, body: Bytes) -> Result<Response> {
    state.rate_limiter.check().await?;

    let mut payload = parse_object(&body)?;
    let model_id = model_id(&payload);
    ensure_responses_supported(state.router.lookup(&model_id).as_deref())?;
    preprocess::responses::rewrite_tools(&mut payload);
    telemetry::record_request(ClientProtocol::Responses, UpstreamEndpoint::Responses);

    let options = preprocess::responses::request_options(&payload);
    forward(state, UpstreamEndpoint::Responses, &payload, &options).await
}

/// 同方言转发：流式按记录原样重新编码，非流式原样返回
async fn forward(
    state: &AppState,
    endpoint: UpstreamEndpoint,
    payload: &Value,
    options: &RequestOptions,
) -> Result<Response> {
    let path = endpoint.request_path();
    if ProtocolDetector::is_stream_value(payload) {
        info!("Streaming passthrough ({})", endpoint.as_str());
        let records = state.proxy.stream(path, payload, options).await?;
        return Ok(sse_response(stream::passthrough(records)));
    }
    Ok(raw_json_response(state.proxy.forward_json(path, payload, options).await?))
}

/// 目录非空时从目录生成列表，否则直接转发上游 /models
pub async fn handle_models(State(state): State<AppState>) -> Response {
    let models = state.router.list();
    if models.is_empty() {
        return match state.proxy.get("/models").await {
            Ok(body) => raw_json_response(body),
            Err(e) => error_response(ClientProtocol::ChatCompletions, &e),
        };
    }

    let created_at = Utc::now().to_rfc3339();
    let data: Vec<Value> = models.iter().map(|m| model_entry(m, &created_at)).collect();
    Json(json!({
        "object": "list",
        "data": data,
        "has_more": false
    }))
    .into_response()
}

fn model_entry(model: &ModelInfo, created_at: &str) -> Value {
    json!({
        "id": model.id,
        "object": "model",
        "type": "model",
        "created": 0,
        "created_at": created_at,
        "owned_by": model.vendor,
        "display_name": if model.name.is_empty() { &model.id } else { &model.name },
    })
}

pub async fn handle_embeddings(State(state): State<AppState>, body: Bytes) -> Response {
    match embeddings(&state, body).await {
        Ok(body) => raw_json_response(body),
        Err(e) => error_response(ClientProtocol::ChatCompletions, &e),
    }
}

async fn embeddings(state: &AppState, body: Bytes) -> Result<Bytes> {
    state.rate_limiter.check().await?;
    parse_object(&body)?;
    debug!("Forwarding embeddings request");
    state.proxy.forward_raw("/embeddings", body).await
}

fn parse_object(body: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(body).map_err(|e| Error::Protocol(format!("Invalid JSON body: {}", e)))?;
    if !value.is_object() {
        return Err(Error::Protocol("Request body must be a JSON object".into()));
    }
    Ok(value)
}

fn model_id(payload: &Value) -> String {
    payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
