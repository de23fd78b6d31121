use crate::config::{ProxyConfig, UpstreamConfig};
use crate::credential::TokenStore;
use crate::error::{Error, Result};
use crate::models::{Initiator, RequestOptions};
use crate::protocol::{sse, SseStream};
use crate::telemetry;
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, Response,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 上游传输层
///
/// 只负责拼 header、发请求、检查状态码；不关心请求体属于哪种方言。
pub struct ProxyForwarder {
    client: Client,
    // 流式专用 client，没有全局超时
    streaming_client: Client,
    base_url: String,
    extra_headers: HeaderMap,
    tokens: Arc<TokenStore>,
}

impl ProxyForwarder {
    pub fn new(config: ProxyConfig, upstream: &UpstreamConfig, tokens: Arc<TokenStore>) -> Result<Self> {
        let client = build_client(&config, Some(config.timeout))?;
        let streaming_client = build_client(&config, None)?;

        let mut extra_headers = HeaderMap::new();
        for (name, value) in &upstream.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Config(format!("Invalid upstream header name: {}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::Config(format!("Invalid value for upstream header {}", name)))?;
            extra_headers.insert(name, value);
        }

        Ok(Self {
            client,
            streaming_client,
            base_url: upstream.base_url.trim_end_matches('/').to_string(),
            extra_headers,
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn headers(&self, options: &RequestOptions) -> Result<HeaderMap> {
        let token = self.tokens.current()?;

        let mut headers = self.extra_headers.clone();
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| Error::Config("Invalid upstream token format".into()))?,
        );
        headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/json"),
        );
        if let Ok(request_id) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(HeaderName::from_static("x-request-id"), request_id);
        }
        headers.insert(
            HeaderName::from_static("x-initiator"),
            HeaderValue::from_static(options.initiator.unwrap_or(Initiator::User).as_str()),
        );
        if options.vision {
            headers.insert(
                HeaderName::from_static("copilot-vision-request"),
                HeaderValue::from_static("true"),
            );
        }
        if let Some(beta) = options.anthropic_beta.as_deref() {
            match HeaderValue::from_str(beta) {
                Ok(value) => {
                    headers.insert(HeaderName::from_static("anthropic-beta"), value);
                }
                Err(_) => warn!("Dropping invalid anthropic-beta header"),
            }
        }
        Ok(headers)
    }

    async fn send(&self, client: &Client, path: &str, body: Bytes, options: &RequestOptions) -> Result<Response> {
        let url = self.url(path);
        info!(
            "send_request: start -> {} (initiator: {}, vision: {})",
            url,
            options.initiator.unwrap_or(Initiator::User).as_str(),
            options.vision
        );

        let response = client
            .post(&url)
            .headers(self.headers(options)?)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("HTTP client connection failed: {:?}", e);
                Error::Http(e)
            })?;

        check_status(response).await
    }

    /// 非流式 JSON 请求，返回完整响应体
    pub async fn forward_json(&self, path: &str, body: &Value, options: &RequestOptions) -> Result<Bytes> {
        let body = Bytes::from(serde_json::to_vec(body)?);
        debug!("Upstream request body (tail): {}", preview(&body));
        let response = self.send(&self.client, path, body, options).await?;
        let body = response.bytes().await.map_err(Error::Http)?;
        debug!("Upstream response body (tail): {}", preview(&body));
        Ok(body)
    }

    /// 原样转发请求体（embeddings）
    pub async fn forward_raw(&self, path: &str, body: Bytes) -> Result<Bytes> {
        let response = self.send(&self.client, path, body, &RequestOptions::default()).await?;
        response.bytes().await.map_err(Error::Http)
    }

    /// 流式请求，返回解码后的 SSE 记录流
    pub async fn stream(&self, path: &str, body: &Value, options: &RequestOptions) -> Result<SseStream> {
        let body = Bytes::from(serde_json::to_vec(body)?);
        debug!("Upstream stream request body (tail): {}", preview(&body));
        let response = self.send(&self.streaming_client, path, body, options).await?;
        info!("stream: established (status {})", response.status());
        Ok(Box::pin(sse::decode(response.bytes_stream())))
    }

    pub async fn get(&self, path: &str) -> Result<Bytes> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .headers(self.headers(&RequestOptions::default())?)
            .send()
            .await?;
        let response = check_status(response).await?;
        response.bytes().await.map_err(Error::Http)
    }
}

fn build_client(config: &ProxyConfig, timeout: Option<Duration>) -> Result<Client> {
    let mut builder = Client::builder()
        .pool_max_idle_per_host(config.max_connections)
        .pool_idle_timeout(Duration::from_secs(60))
        .tcp_keepalive(if config.keep_alive {
            Some(Duration::from_secs(30))
        } else {
            None
        });
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(Error::Http)
}

/// 非 2xx 转成 `Error::Upstream`，保留状态码和原始响应体
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());
    error!("Upstream error response (status {}): {}", status, body);
    telemetry::record_upstream_error(status.as_u16());

    Err(Error::Upstream {
        status: status.as_u16(),
        body,
    })
}

/// 日志里只保留最后 400 个字符
pub fn preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(400)).collect()
}
