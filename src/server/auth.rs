//! 入站 API Key 校验

use super::{error::error_response, AppState};
use crate::error::Error;
use crate::models::ClientProtocol;
use crate::protocol::detector::ProtocolDetector;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

/// 未配置任何 key 时放行；否则 `Authorization: Bearer` 或 `x-api-key` 必须命中其一
pub async fn require_api_key(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    if state.api_keys.is_empty() {
        return next.run(request).await;
    }

    let dialect = ProtocolDetector::detect_from_path(request.uri().path()).unwrap_or(ClientProtocol::ChatCompletions);

    match extract_api_key(request.headers()) {
        None => error_response(dialect, &Error::Unauthorized("Missing API key".into())),
        Some(provided) if !is_valid(&state.api_keys, &provided) => {
            error_response(dialect, &Error::Unauthorized("Invalid API key".into()))
        }
        Some(_) => next.run(request).await,
    }
}

pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));
    if let Some(key) = bearer {
        return Some(key.to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn is_valid(keys: &[String], provided: &str) -> bool {
    // 逐个比较，不提前返回
    keys.iter().fold(false, |found, key| {
        let matched: bool = key.as_bytes().ct_eq(provided.as_bytes()).into();
        found | matched
    })
}
