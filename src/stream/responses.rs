//! Responses 流式事件 -> Anthropic 流式事件

use super::state::{BlockKey, StreamState};
use crate::protocol::anthropic::{AnthropicResponse, AnthropicStreamEvent, AnthropicUsage, BlockDelta, ContentBlockStart, MessageDeltaBody};
use crate::protocol::responses::{ReasoningItem, ResponseOutputItem, ResponseStreamEvent, ResponsesResult};
use crate::translate::responses::{reasoning_text, translate_result};
use crate::translate::{encode_signature, usage_from_responses, THINKING_TEXT};
use tracing::warn;

type Events = Vec<AnthropicStreamEvent>;

/// 推理摘要可能分成多段 summary_index，统一合并到同一个块
const REASONING_CONTENT_INDEX: u32 = 0;

pub fn translate_event(event: ResponseStreamEvent, state: &mut StreamState) -> Events {
    if state.message_completed {
        return Vec::new();
    }

    match event {
        ResponseStreamEvent::Created { response } => message_start(&response, state),
        ResponseStreamEvent::OutputItemAdded { output_index, item } => match item {
            ResponseOutputItem::FunctionCall(call) => {
                let mut events = Vec::new();
                let index = state.ensure_tool_block(
                    output_index,
                    call.call_id.as_deref(),
                    call.name.as_deref(),
                    &mut events,
                );
                if !call.arguments.is_empty() {
                    if let Err(e) = feed_guard(state, output_index, &call.arguments) {
                        events.extend(state.fail(e));
                        return events;
                    }
                    state.push_delta(
                        index,
                        BlockDelta::InputJsonDelta {
                            partial_json: call.arguments,
                        },
                        &mut events,
                    );
                }
                events
            }
            _ => Vec::new(),
        },
        ResponseStreamEvent::FunctionCallArgumentsDelta { output_index, delta } => {
            let mut events = Vec::new();
            if delta.is_empty() {
                return events;
            }
            let index = state.ensure_tool_block(output_index, None, None, &mut events);
            if let Err(e) = feed_guard(state, output_index, &delta) {
                events.extend(state.fail(e));
                return events;
            }
            state.push_delta(index, BlockDelta::InputJsonDelta { partial_json: delta }, &mut events);
            events
        }
        ResponseStreamEvent::FunctionCallArgumentsDone { output_index, arguments } => {
            let mut events = Vec::new();
            let index = state.ensure_tool_block(output_index, None, None, &mut events);
            if !state.has_delta(index) && !arguments.is_empty() {
                state.push_delta(
                    index,
                    BlockDelta::InputJsonDelta {
                        partial_json: arguments,
                    },
                    &mut events,
                );
            }
            state.tool_calls.remove(&output_index);
            events
        }
        ResponseStreamEvent::OutputTextDelta {
            output_index,
            content_index,
            delta,
        } => {
            let mut events = Vec::new();
            if delta.is_empty() {
                return events;
            }
            let index = state.ensure_keyed_block((output_index, content_index), text_start, &mut events);
            state.push_delta(index, BlockDelta::TextDelta { text: delta }, &mut events);
            events
        }
        ResponseStreamEvent::OutputTextDone {
            output_index,
            content_index,
            text,
        } => synthesize_if_silent((output_index, content_index), text, text_start, state, |text| {
            BlockDelta::TextDelta { text }
        }),
        ResponseStreamEvent::ReasoningSummaryTextDelta {
            output_index, delta, ..
        } => {
            let mut events = Vec::new();
            if delta.is_empty() {
                return events;
            }
            let index = state.ensure_keyed_block(reasoning_key(output_index), thinking_start, &mut events);
            state.push_delta(index, BlockDelta::ThinkingDelta { thinking: delta }, &mut events);
            events
        }
        ResponseStreamEvent::ReasoningSummaryTextDone {
            output_index, text, ..
        } => synthesize_if_silent(reasoning_key(output_index), text, thinking_start, state, |thinking| {
            BlockDelta::ThinkingDelta { thinking }
        }),
        ResponseStreamEvent::OutputItemDone { output_index, item } => match item {
            ResponseOutputItem::Reasoning(reasoning) => reasoning_done(output_index, &reasoning, state),
            _ => Vec::new(),
        },
        ResponseStreamEvent::Completed { response } | ResponseStreamEvent::Incomplete { response } => {
            message_finish(&response, state)
        }
        ResponseStreamEvent::Failed { response } => {
            let message = response
                .error
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "The response failed due to an unknown error.".to_string());
            warn!(message = %message, "Upstream response failed");
            state.fail(message)
        }
        ResponseStreamEvent::Error { message, code } => {
            let message = message.unwrap_or_else(|| "An unexpected error occurred during streaming.".to_string());
            warn!(message = %message, code = ?code, "Upstream stream error");
            state.fail(message)
        }
        ResponseStreamEvent::Unknown => Vec::new(),
    }
}

fn text_start() -> ContentBlockStart {
    ContentBlockStart::Text { text: String::new() }
}

fn thinking_start() -> ContentBlockStart {
    ContentBlockStart::Thinking {
        thinking: String::new(),
    }
}

fn reasoning_key(output_index: u32) -> BlockKey {
    (output_index, REASONING_CONTENT_INDEX)
}

fn feed_guard(state: &mut StreamState, output_index: u32, fragment: &str) -> Result<(), String> {
    match state.tool_calls.get_mut(&output_index) {
        Some(call) => call.whitespace.feed(fragment).map_err(|e| {
            warn!(tool_call_id = %call.id, "{}", e);
            match e {
                crate::error::Error::StreamValidation(message) => message,
                other => other.to_string(),
            }
        }),
        None => Err("Received function call arguments delta without an open tool call block.".to_string()),
    }
}

/// done 事件：该位置从未收到过增量时，用完整内容补一个增量
fn synthesize_if_silent(
    key: BlockKey,
    full: String,
    start: fn() -> ContentBlockStart,
    state: &mut StreamState,
    delta: impl FnOnce(String) -> BlockDelta,
) -> Events {
    let mut events = Vec::new();
    if full.is_empty() || state.key_has_delta(key) {
        return events;
    }
    let index = state.ensure_keyed_block(key, start, &mut events);
    state.push_delta(index, delta(full), &mut events);
    events
}

fn reasoning_done(output_index: u32, item: &ReasoningItem, state: &mut StreamState) -> Events {
    let mut events = Vec::new();
    let index = state.ensure_keyed_block(reasoning_key(output_index), thinking_start, &mut events);

    if item.summary.is_empty() {
        state.push_delta(
            index,
            BlockDelta::ThinkingDelta {
                thinking: THINKING_TEXT.to_string(),
            },
            &mut events,
        );
    } else if !state.has_delta(index) {
        let thinking = reasoning_text(item);
        if !thinking.is_empty() {
            state.push_delta(index, BlockDelta::ThinkingDelta { thinking }, &mut events);
        }
    }

    let signature = encode_signature(item.encrypted_content.as_deref().unwrap_or_default(), &item.id);
    state.push_delta(index, BlockDelta::SignatureDelta { signature }, &mut events);
    events
}

fn message_start(response: &ResponsesResult, state: &mut StreamState) -> Events {
    if state.message_start_sent {
        return Vec::new();
    }
    state.message_start_sent = true;

    let mut message = AnthropicResponse::new(response.id.clone(), response.model.clone(), Vec::new());
    // 输出 token 在 message_delta 中上报
    message.usage = AnthropicUsage {
        output_tokens: 0,
        ..usage_from_responses(response.usage.as_ref())
    };
    vec![AnthropicStreamEvent::MessageStart { message }]
}

fn message_finish(response: &ResponsesResult, state: &mut StreamState) -> Events {
    let mut events = Vec::new();
    state.close_all(&mut events);
    state.tool_calls.clear();

    let anthropic = translate_result(response);
    events.push(AnthropicStreamEvent::MessageDelta {
        delta: MessageDeltaBody {
            stop_reason: anthropic.stop_reason,
            stop_sequence: anthropic.stop_sequence,
        },
        usage: Some(anthropic.usage),
    });
    events.push(AnthropicStreamEvent::MessageStop);
    state.message_completed = true;
    events
}
