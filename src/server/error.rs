use crate::error::Error;
use crate::models::ClientProtocol;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{error, warn};

/// 按调用方方言构造错误响应
///
/// OpenAI 两种方言：`{"error": {"message", "type"}}`
/// Anthropic：`{"type": "error", "error": {"type", "message"}}`
pub fn error_response(dialect: ClientProtocol, err: &Error) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    let message = error_message(err);
    let error_type = err.error_type();

    if err.is_client_error() {
        warn!("Request rejected ({}): {}", status, message);
    } else {
        error!("Request failed ({}): {}", status, message);
    }

    let body = match dialect {
        ClientProtocol::Messages => json!({
            "type": "error",
            "error": { "type": error_type, "message": message }
        }),
        ClientProtocol::ChatCompletions | ClientProtocol::Responses => json!({
            "error": { "message": message, "type": error_type }
        }),
    };

    let mut response = (status, Json(body)).into_response();
    if let Error::RateLimited { retry_after_secs } = err {
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

/// 上游错误体是 JSON 时取其中的 message，否则用原始文本
fn error_message(err: &Error) -> String {
    match err {
        Error::Upstream { body, .. } => serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .or_else(|| v.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| body.clone()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn anthropic_shape_for_messages_clients() {
        let response = error_response(
            ClientProtocol::Messages,
            &Error::Upstream {
                status: 400,
                body: r#"{"error":{"message":"prompt too long","type":"invalid_request_error"}}"#.into(),
            },
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body(response).await,
            json!({"type": "error", "error": {"type": "invalid_request_error", "message": "prompt too long"}})
        );
    }

    #[tokio::test]
    async fn openai_shape_with_retry_after() {
        let response = error_response(
            ClientProtocol::ChatCompletions,
            &Error::RateLimited { retry_after_secs: 3 },
        );
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
        assert_eq!(body(response).await["error"]["type"], "rate_limit_error");
    }

    #[tokio::test]
    async fn non_json_upstream_body_is_kept_verbatim() {
        let response = error_response(
            ClientProtocol::Responses,
            &Error::Upstream {
                status: 502,
                body: "Bad Gateway".into(),
            },
        );
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body(response).await["error"]["message"], "Bad Gateway");
    }
}
