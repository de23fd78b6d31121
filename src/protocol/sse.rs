use crate::error::{Error, Result};
use crate::protocol::anthropic::AnthropicStreamEvent;
use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use std::fmt::Display;

/// 一条上游 SSE 记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseRecord {
    /// `event:` 字段；上游未给出时为空
    pub event: Option<String>,
    pub data: String,
}

impl SseRecord {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }
}

/// 生成 SSE 格式的字符串
///
/// - OpenAI: "data: {...}\n\n"
/// - Anthropic: "event: content_block_delta\ndata: {...}\n\n"
pub fn format_sse(event: Option<&str>, data: &str) -> String {
    if let Some(event) = event {
        format!("event: {}\ndata: {}\n\n", event, data)
    } else {
        format!("data: {}\n\n", data)
    }
}

/// 把一个 Anthropic 事件编码成一帧 SSE
pub fn encode_event(event: &AnthropicStreamEvent) -> Result<Bytes> {
    let data = serde_json::to_string(event)?;
    Ok(Bytes::from(format_sse(Some(event.event_name()), &data)))
}

/// 将上游字节流解码为 SSE 记录流
///
/// 行拆分、多行 data 拼接和注释行由 eventsource-stream 处理；
/// 默认事件名 `message` 视为未命名。
pub fn decode<S, E>(stream: S) -> impl Stream<Item = Result<SseRecord>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<Error> + Display + Send + 'static,
{
    stream.eventsource().map(|item| match item {
        Ok(event) => {
            let name = match event.event.as_str() {
                "" | "message" => None,
                other => Some(other.to_string()),
            };
            Ok(SseRecord {
                event: name,
                data: event.data,
            })
        }
        Err(EventStreamError::Transport(e)) => Err(e.into()),
        Err(EventStreamError::Utf8(e)) => Err(Error::StreamValidation(e.to_string())),
        Err(EventStreamError::Parser(e)) => Err(Error::StreamValidation(e.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn decodes_named_and_unnamed_records_across_chunk_boundaries() {
        let chunks = vec![
            Ok::<_, Error>(Bytes::from("event: response.created\ndata: {\"a\"")),
            Ok(Bytes::from(":1}\n\ndata: [DONE]\n\n")),
        ];
        let records: Vec<SseRecord> = decode(stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(
            records,
            vec![
                SseRecord {
                    event: Some("response.created".into()),
                    data: "{\"a\":1}".into()
                },
                SseRecord::data("[DONE]"),
            ]
        );
    }

    #[test]
    fn encodes_anthropic_events_with_event_line() {
        let frame = encode_event(&AnthropicStreamEvent::MessageStop).unwrap();
        assert_eq!(frame, Bytes::from("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
    }
}
