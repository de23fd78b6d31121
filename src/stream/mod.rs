//! 流式转换管道
//!
//! 每个流式响应对应一个 `StreamState`，由唯一的消费循环持有。
//! 客户端断开时输出流被丢弃，上游流随之被丢弃，连接关闭。

pub mod chat;
pub mod guard;
pub mod responses;
pub mod state;

use crate::error::Error;
use crate::protocol::anthropic::AnthropicStreamEvent;
use crate::protocol::openai::ChatCompletionChunk;
use crate::protocol::responses::ResponseStreamEvent;
use crate::protocol::sse::{encode_event, format_sse};
use crate::protocol::{ByteStream, SseStream};
use crate::telemetry;
use bytes::Bytes;
use futures::StreamExt;
use state::StreamState;
use tracing::{debug, warn};

/// Chat 流的结束标记
const DONE_MARKER: &str = "[DONE]";

/// Chat Completions 上游流 -> Anthropic SSE
pub fn chat_to_anthropic(mut records: SseStream) -> ByteStream {
    Box::pin(async_stream::stream! {
        let mut state = StreamState::new();

        while let Some(record) = records.next().await {
            let events = match record {
                Ok(record) => {
                    let data = record.data.trim();
                    if data == DONE_MARKER {
                        break;
                    }
                    if data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ChatCompletionChunk>(data) {
                        Ok(chunk) => chat::translate_chunk(&chunk, &mut state),
                        Err(e) => {
                            warn!(error = %e, "Malformed chat completion chunk");
                            telemetry::record_stream_error("malformed_event");
                            state.fail(format!("Malformed upstream chunk: {}", e))
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Upstream stream transport error");
                    telemetry::record_stream_error("transport");
                    state.fail(e.to_string())
                }
            };

            for event in &events {
                yield emit(event);
            }
            if state.message_completed {
                break;
            }
        }

        for event in chat::flush_pending(&mut state) {
            yield emit(&event);
        }

        if !state.message_completed {
            let incomplete = Error::IncompleteStream("Chat completions");
            warn!("{}", incomplete);
            telemetry::record_stream_error("incomplete");
            for event in state.fail(incomplete.to_string()) {
                yield emit(&event);
            }
        }
    })
}

/// Responses 上游流 -> Anthropic SSE
pub fn responses_to_anthropic(mut records: SseStream) -> ByteStream {
    Box::pin(async_stream::stream! {
        let mut state = StreamState::new();

        while let Some(record) = records.next().await {
            let events = match record {
                Ok(record) => {
                    if record.event.as_deref() == Some("ping") {
                        yield emit(&AnthropicStreamEvent::Ping);
                        continue;
                    }
                    if record.data.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ResponseStreamEvent>(&record.data) {
                        Ok(event) => responses::translate_event(event, &mut state),
                        Err(e) => {
                            warn!(error = %e, "Malformed responses stream event");
                            telemetry::record_stream_error("malformed_event");
                            state.fail(format!("Malformed upstream event: {}", e))
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Upstream stream transport error");
                    telemetry::record_stream_error("transport");
                    state.fail(e.to_string())
                }
            };

            for event in &events {
                yield emit(event);
            }
            if state.message_completed {
                break;
            }
        }

        if !state.message_completed {
            let incomplete = Error::IncompleteStream("Responses");
            warn!("{}", incomplete);
            telemetry::record_stream_error("incomplete");
            for event in state.fail(incomplete.to_string()) {
                yield emit(&event);
            }
        }
    })
}

/// 同协议转发：原样重新编码每条记录
pub fn passthrough(mut records: SseStream) -> ByteStream {
    Box::pin(async_stream::stream! {
        while let Some(record) = records.next().await {
            match record {
                Ok(record) => {
                    yield Ok(Bytes::from(format_sse(record.event.as_deref(), &record.data)));
                }
                Err(e) => {
                    warn!(error = %e, "Upstream stream transport error during passthrough");
                    telemetry::record_stream_error("transport");
                    yield Err(e);
                    break;
                }
            }
        }
        debug!("Passthrough stream finished");
    })
}

fn emit(event: &AnthropicStreamEvent) -> crate::error::Result<Bytes> {
    match event {
        AnthropicStreamEvent::MessageDelta { usage: Some(usage), .. } => telemetry::record_usage(usage),
        AnthropicStreamEvent::Error { error } => debug!(message = %error.message, "Emitting stream error event"),
        _ => {}
    }
    encode_event(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sse::SseRecord;
    use futures::stream;

    fn records(items: Vec<crate::error::Result<SseRecord>>) -> SseStream {
        Box::pin(stream::iter(items))
    }

    async fn collect(stream: ByteStream) -> String {
        let frames: Vec<Bytes> = stream.map(|b| b.unwrap()).collect().await;
        frames.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect()
    }

    fn event_names(body: &str) -> Vec<&str> {
        body.lines().filter_map(|l| l.strip_prefix("event: ")).collect()
    }

    #[tokio::test]
    async fn truncated_responses_stream_ends_with_error() {
        let body = collect(responses_to_anthropic(records(vec![
            Ok(SseRecord {
                event: Some("response.created".into()),
                data: r#"{"type":"response.created","response":{"id":"r","model":"m","status":"in_progress","output":[]}}"#.into(),
            }),
            Ok(SseRecord::data(
                r#"{"type":"response.output_text.delta","output_index":0,"content_index":0,"delta":"hi"}"#,
            )),
        ])))
        .await;

        assert_eq!(
            event_names(&body),
            vec!["message_start", "content_block_start", "content_block_delta", "content_block_stop", "error"]
        );
        assert!(body.contains("Responses stream ended without completion"));
    }

    #[tokio::test]
    async fn responses_ping_is_forwarded() {
        let body = collect(responses_to_anthropic(records(vec![
            Ok(SseRecord {
                event: Some("ping".into()),
                data: String::new(),
            }),
            Ok(SseRecord::data(
                r#"{"type":"response.completed","response":{"id":"r","model":"m","status":"completed","output":[]}}"#,
            )),
        ])))
        .await;
        assert_eq!(event_names(&body), vec!["ping", "message_delta", "message_stop"]);
    }

    #[tokio::test]
    async fn chat_stream_stops_at_done_marker() {
        let body = collect(chat_to_anthropic(records(vec![
            Ok(SseRecord::data(
                r#"{"id":"c","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":"stop"}]}"#,
            )),
            Ok(SseRecord::data("[DONE]")),
            Ok(SseRecord::data("not reached")),
        ])))
        .await;
        assert_eq!(
            event_names(&body),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
    }

    #[tokio::test]
    async fn chat_transport_error_becomes_error_event() {
        let body = collect(chat_to_anthropic(records(vec![
            Ok(SseRecord::data(
                r#"{"id":"c","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]}"#,
            )),
            Err(Error::StreamValidation("connection reset".into())),
        ])))
        .await;
        let names = event_names(&body);
        assert_eq!(names.last(), Some(&"error"));
        assert_eq!(names.iter().filter(|n| **n == "error").count(), 1);
        assert!(body.contains("connection reset"));
    }

    #[tokio::test]
    async fn malformed_chunk_fails_stream() {
        let body = collect(chat_to_anthropic(records(vec![Ok(SseRecord::data("{not json"))]))).await;
        assert_eq!(event_names(&body), vec!["error"]);
    }

    #[tokio::test]
    async fn passthrough_preserves_event_names() {
        let body = collect(passthrough(records(vec![
            Ok(SseRecord {
                event: Some("message_start".into()),
                data: "{}".into(),
            }),
            Ok(SseRecord::data("[DONE]")),
        ])))
        .await;
        assert_eq!(body, "event: message_start\ndata: {}\n\ndata: [DONE]\n\n");
    }
}
