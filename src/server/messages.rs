//! Anthropic Messages 入站
//!
//! 预处理 -> 选路 -> 翻译 -> 转发 -> 翻译回 Anthropic

use super::{error::error_response, raw_json_response, sse_response, AppState};
use crate::error::{Error, Result};
use crate::models::{ClientProtocol, Initiator, UpstreamEndpoint};
use crate::preprocess::{self, messages as rules};
use crate::protocol::anthropic::AnthropicMessagesPayload;
use crate::protocol::ProtocolAdapter;
use crate::proxy::preview;
use crate::stream;
use crate::telemetry;
use crate::translate::{ChatAdapter, ResponsesAdapter};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, info};

pub async fn handle_messages(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match messages(&state, &headers, body).await {
        Ok(response) => response,
        Err(e) => error_response(ClientProtocol::Messages, &e),
    }
}

async fn messages(state: &AppState, headers: &HeaderMap, body: Bytes) -> Result<Response> {
    state.rate_limiter.check().await?;

    let mut payload: AnthropicMessagesPayload =
        serde_json::from_slice(&body).map_err(|e| Error::Protocol(format!("Invalid Messages request: {}", e)))?;
    debug!("Anthropic request (tail): {}", preview(&body));

    let anthropic_beta = headers
        .get("anthropic-beta")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let outcome = preprocess::preprocess(&mut payload, anthropic_beta.as_deref(), state.small_fast_model.as_deref());
    if outcome.is_compact {
        debug!("Compact request detected");
    }

    let (endpoint, model) = state.router.resolve(ClientProtocol::Messages, &payload.model);
    telemetry::record_request(ClientProtocol::Messages, endpoint);

    match endpoint {
        UpstreamEndpoint::Messages => {
            rules::filter_thinking_blocks(&mut payload);
            rules::apply_adaptive_thinking(&mut payload, model.as_deref());
            let options =
                rules::native_request_options(&payload, outcome.initiator_override, anthropic_beta.as_deref());
            let upstream = serde_json::to_value(&payload)?;
            let path = endpoint.request_path();

            if payload.stream.unwrap_or(false) {
                info!("Streaming response from upstream (Messages API)");
                let records = state.proxy.stream(path, &upstream, &options).await?;
                Ok(sse_response(stream::passthrough(records)))
            } else {
                Ok(raw_json_response(state.proxy.forward_json(path, &upstream, &options).await?))
            }
        }
        UpstreamEndpoint::Responses => translated(state, &ResponsesAdapter, &payload, outcome.initiator_override).await,
        UpstreamEndpoint::ChatCompletions => {
            translated(state, &ChatAdapter, &payload, outcome.initiator_override).await
        }
    }
}

/// 经由 OpenAI 方言上游的路径
async fn translated(
    state: &AppState,
    adapter: &dyn ProtocolAdapter,
    payload: &AnthropicMessagesPayload,
    initiator_override: Option<Initiator>,
) -> Result<Response> {
    let upstream = adapter.transform_request(payload)?;
    debug!(
        "Translated {} payload (tail): {}",
        adapter.endpoint().as_str(),
        preview(upstream.to_string().as_bytes())
    );

    let mut options = adapter.request_options(&upstream);
    if initiator_override.is_some() {
        options.initiator = initiator_override;
    }
    let path = adapter.endpoint().request_path();

    if payload.stream.unwrap_or(false) {
        info!("Streaming response from upstream ({})", adapter.endpoint().as_str());
        let records = state.proxy.stream(path, &upstream, &options).await?;
        return Ok(sse_response(adapter.transform_stream(records)));
    }

    let body = state.proxy.forward_json(path, &upstream, &options).await?;
    let response = adapter.transform_response(&body)?;
    telemetry::record_usage(&response.usage);
    Ok(Json(response).into_response())
}
