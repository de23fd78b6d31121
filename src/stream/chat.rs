//! Chat Completions chunk -> Anthropic 流式事件

use super::state::{PendingStop, StreamState};
use crate::protocol::anthropic::{AnthropicResponse, AnthropicStreamEvent, BlockDelta, ContentBlockStart, MessageDeltaBody, StopReason};
use crate::protocol::openai::{ChatCompletionChunk, ChatUsage};
use crate::translate::{map_openai_stop_reason, usage_from_chat};
use tracing::warn;

type Events = Vec<AnthropicStreamEvent>;

/// Chat 流只有一个文本位置
const TEXT_KEY: (u32, u32) = (0, 0);

pub fn translate_chunk(chunk: &ChatCompletionChunk, state: &mut StreamState) -> Events {
    let mut events = Vec::new();
    if state.message_completed {
        return events;
    }

    // 只带 usage 的尾包
    let Some(choice) = chunk.choices.first() else {
        if chunk.usage.is_some() {
            if let Some(pending) = state.pending_stop.take() {
                finish(pending.stop_reason, chunk.usage.as_ref(), state, &mut events);
            }
        }
        return events;
    };

    if !state.message_start_sent {
        let mut message = AnthropicResponse::new(chunk.id.clone(), chunk.model.clone(), Vec::new());
        message.usage = usage_from_chat(chunk.usage.as_ref());
        message.usage.output_tokens = 0;
        events.push(AnthropicStreamEvent::MessageStart { message });
        state.message_start_sent = true;
    }

    let delta = &choice.delta;

    if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
        let index = state.ensure_keyed_block(
            TEXT_KEY,
            || ContentBlockStart::Text { text: String::new() },
            &mut events,
        );
        state.push_delta(index, BlockDelta::TextDelta { text: text.to_string() }, &mut events);
    }

    for call in delta.tool_calls.iter().flatten() {
        let function = call.function.as_ref();
        let name = function.and_then(|f| f.name.as_deref());

        // 带 id 和 name 的分片表示一个新的工具调用
        if let (Some(id), Some(name)) = (call.id.as_deref(), name) {
            state.tool_calls.remove(&call.index);
            state.ensure_tool_block(call.index, Some(id), Some(name), &mut events);
        }

        let Some(arguments) = function.and_then(|f| f.arguments.as_deref()).filter(|a| !a.is_empty()) else {
            continue;
        };
        if !state.tool_calls.contains_key(&call.index) {
            warn!(index = call.index, "Dropping arguments for unknown tool call");
            continue;
        }

        let index = state.ensure_tool_block(call.index, None, None, &mut events);
        let guarded = match state.tool_calls.get_mut(&call.index) {
            Some(tool) => tool.whitespace.feed(arguments),
            None => Ok(()),
        };
        if let Err(e) = guarded {
            warn!(error = %e, "Aborting chat stream");
            let message = match e {
                crate::error::Error::StreamValidation(message) => message,
                other => other.to_string(),
            };
            events.extend(state.fail(message));
            return events;
        }
        state.push_delta(
            index,
            BlockDelta::InputJsonDelta {
                partial_json: arguments.to_string(),
            },
            &mut events,
        );
    }

    if let Some(reason) = choice.finish_reason.as_deref() {
        state.close_all(&mut events);
        state.tool_calls.clear();
        let stop_reason = map_openai_stop_reason(Some(reason));
        if chunk.usage.is_some() {
            finish(stop_reason, chunk.usage.as_ref(), state, &mut events);
        } else {
            // usage 可能在后面单独的 chunk 里
            state.pending_stop = Some(PendingStop { stop_reason });
        }
    }

    events
}

/// 上游流结束（[DONE] 或连接关闭）时补发挂起的结束事件
pub fn flush_pending(state: &mut StreamState) -> Events {
    let mut events = Vec::new();
    if let Some(pending) = state.pending_stop.take() {
        finish(pending.stop_reason, None, state, &mut events);
    }
    events
}

fn finish(stop_reason: Option<StopReason>, usage: Option<&ChatUsage>, state: &mut StreamState, events: &mut Events) {
    events.push(AnthropicStreamEvent::MessageDelta {
        delta: MessageDeltaBody {
            stop_reason,
            stop_sequence: None,
        },
        usage: Some(usage_from_chat(usage)),
    });
    events.push(AnthropicStreamEvent::MessageStop);
    state.message_completed = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::state::assert_well_formed;
    use serde_json::{json, Value};

    fn run(chunks: Vec<Value>) -> (Events, StreamState) {
        let mut state = StreamState::new();
        let mut events = Vec::new();
        for value in chunks {
            let chunk: ChatCompletionChunk = serde_json::from_value(value).unwrap();
            events.extend(translate_chunk(&chunk, &mut state));
        }
        (events, state)
    }

    fn chunk(delta: Value, finish_reason: Value) -> Value {
        json!({"id": "chatcmpl-1", "model": "gpt-4o", "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]})
    }

    #[test]
    fn text_then_tool_call_then_finish() {
        let (events, state) = run(vec![
            chunk(json!({"role": "assistant", "content": "Let me "}), Value::Null),
            chunk(json!({"content": "check."}), Value::Null),
            chunk(json!({"tool_calls": [{"index": 0, "id": "call_1", "type": "function",
                "function": {"name": "read", "arguments": ""}}]}), Value::Null),
            chunk(json!({"tool_calls": [{"index": 0, "function": {"arguments": "{\"p\":"}}]}), Value::Null),
            chunk(json!({"tool_calls": [{"index": 0, "function": {"arguments": "1}"}}]}), Value::Null),
            json!({"id": "chatcmpl-1", "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}],
                "usage": {"prompt_tokens": 100, "completion_tokens": 8, "total_tokens": 108,
                    "prompt_tokens_details": {"cached_tokens": 30}}}),
        ]);

        assert!(state.message_completed);
        assert_well_formed(&events);
        let names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        match &events[9] {
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
                assert_eq!(usage.as_ref().unwrap().input_tokens, 70);
                assert_eq!(usage.as_ref().unwrap().cache_read_input_tokens, Some(30));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn finish_waits_for_trailing_usage_chunk() {
        let (events, state) = run(vec![
            chunk(json!({"content": "hi"}), Value::Null),
            chunk(json!({}), json!("stop")),
            json!({"id": "chatcmpl-1", "model": "gpt-4o", "choices": [],
                "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}}),
        ]);
        assert!(state.message_completed);
        match &events[events.len() - 2] {
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::EndTurn));
                assert_eq!(usage.as_ref().unwrap().output_tokens, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn pending_finish_flushes_without_usage() {
        let (mut events, mut state) = run(vec![
            chunk(json!({"content": "hi"}), Value::Null),
            chunk(json!({}), json!("length")),
        ]);
        assert!(!state.message_completed);
        events.extend(flush_pending(&mut state));
        assert!(state.message_completed);
        assert_eq!(events.last(), Some(&AnthropicStreamEvent::MessageStop));
        assert_well_formed(&events);
    }

    #[test]
    fn parallel_tool_calls_get_distinct_blocks() {
        let (events, _) = run(vec![
            chunk(json!({"tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "read", "arguments": "{}"}},
                {"index": 1, "id": "call_b", "function": {"name": "grep", "arguments": "{}"}}
            ]}), Value::Null),
            chunk(json!({}), json!("tool_calls")),
        ]);
        assert_well_formed(&events);
        let ids: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                AnthropicStreamEvent::ContentBlockStart {
                    content_block: ContentBlockStart::ToolUse { id, .. },
                    ..
                } => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["call_a", "call_b"]);
    }

    #[test]
    fn whitespace_runaway_in_chat_arguments() {
        let (events, state) = run(vec![
            chunk(json!({"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "write", "arguments": "{\"x\":"}}]}), Value::Null),
            chunk(json!({"tool_calls": [{"index": 0, "function": {"arguments": "\n ".repeat(11)}}]}), Value::Null),
            chunk(json!({"content": "after"}), Value::Null),
        ]);
        assert!(state.message_completed);
        assert_well_formed(&events);
        assert!(matches!(events.last(), Some(AnthropicStreamEvent::Error { .. })));
    }
}
