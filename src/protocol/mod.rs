pub mod anthropic;
pub mod detector;
pub mod openai;
pub mod responses;
pub mod sse;

use crate::error::Result;
use crate::models::{RequestOptions, UpstreamEndpoint};
use anthropic::{AnthropicMessagesPayload, AnthropicResponse};
use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use sse::SseRecord;
use std::pin::Pin;

/// 上游SSE记录流
pub type SseStream = Pin<Box<dyn Stream<Item = Result<SseRecord>> + Send>>;

/// 发给客户端的SSE字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Anthropic Messages 客户端与某个 OpenAI 方言上游之间的适配器
///
/// 原生 Messages 上游不需要适配器，直接转发。
pub trait ProtocolAdapter: Send + Sync {
    /// 适配器对应的上游端点
    fn endpoint(&self) -> UpstreamEndpoint;

    /// Anthropic 请求 -> 上游请求体
    fn transform_request(&self, payload: &AnthropicMessagesPayload) -> Result<Value>;

    /// 从翻译后的上游请求体推断附加header（vision / initiator）
    fn request_options(&self, upstream_payload: &Value) -> RequestOptions;

    /// 上游非流式响应 -> Anthropic 响应
    fn transform_response(&self, body: &[u8]) -> Result<AnthropicResponse>;

    /// 上游SSE记录流 -> Anthropic SSE字节流
    fn transform_stream(&self, records: SseStream) -> ByteStream;
}
