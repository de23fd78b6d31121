//! Anthropic Messages <-> OpenAI Chat Completions

use super::{map_openai_stop_reason, normalize_model_name, parse_function_call_arguments, usage_from_chat};
use crate::error::Result;
use crate::models::{RequestOptions, UpstreamEndpoint};
use crate::protocol::anthropic::{
    AnthropicMessage, AnthropicMessagesPayload, AnthropicResponse, AnthropicTool, AnthropicToolChoice,
    ContentBlock, MessageContent, Role, SystemPrompt, ToolResultContent, ToolUseBlock,
};
use crate::protocol::openai::{
    ChatCompletionResponse, ChatCompletionsPayload, ChatContent, ChatMessage, ChatRole, ChatTool,
    ChatToolChoice, ContentPart, FunctionCall, FunctionDefinition, ImageUrl, NamedFunction, ToolCall,
};
use crate::protocol::{ByteStream, ProtocolAdapter, SseStream};
use serde_json::{Map, Value};
use tracing::debug;

// ================== 请求: Anthropic -> Chat ==================

pub fn translate_to_openai(payload: &AnthropicMessagesPayload) -> ChatCompletionsPayload {
    let mut messages = translate_system(payload.system.as_ref());
    for message in &payload.messages {
        match message.role {
            Role::User => messages.extend(translate_user_message(message)),
            Role::Assistant => messages.extend(translate_assistant_message(message)),
        }
    }

    ChatCompletionsPayload {
        model: normalize_model_name(&payload.model),
        messages,
        max_tokens: Some(payload.max_tokens),
        temperature: payload.temperature,
        top_p: payload.top_p,
        stop: payload.stop_sequences.clone(),
        stream: payload.stream,
        user: payload.metadata.as_ref().and_then(|m| m.user_id.clone()),
        tools: payload.tools.as_deref().map(translate_tools),
        tool_choice: payload.tool_choice.as_ref().and_then(translate_tool_choice),
        ..Default::default()
    }
}

fn translate_system(system: Option<&SystemPrompt>) -> Vec<ChatMessage> {
    let Some(system) = system else {
        return Vec::new();
    };
    let text = match system {
        SystemPrompt::Text(text) => text.clone(),
        SystemPrompt::Blocks(_) => system.texts().join("\n\n"),
    };
    if text.is_empty() {
        return Vec::new();
    }
    vec![ChatMessage::new(ChatRole::System, Some(ChatContent::Text(text)))]
}

// tool_result 必须排在其余用户内容之前：tool_use -> tool_result -> user
fn translate_user_message(message: &AnthropicMessage) -> Vec<ChatMessage> {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            return vec![ChatMessage::new(ChatRole::User, Some(ChatContent::Text(text.clone())))]
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut messages = Vec::new();
    let mut others = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::ToolResult(result) => {
                let content = match &result.content {
                    ToolResultContent::Text(text) => ChatContent::Text(text.clone()),
                    ToolResultContent::Blocks(inner) => map_content(inner),
                };
                let mut tool = ChatMessage::new(ChatRole::Tool, Some(content));
                tool.tool_call_id = Some(result.tool_use_id.clone());
                messages.push(tool);
            }
            other => others.push(other.clone()),
        }
    }

    if !others.is_empty() {
        messages.push(ChatMessage::new(ChatRole::User, Some(map_content(&others))));
    }

    messages
}

fn translate_assistant_message(message: &AnthropicMessage) -> Vec<ChatMessage> {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            return vec![ChatMessage::new(
                ChatRole::Assistant,
                Some(ChatContent::Text(text.clone())),
            )]
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let tool_uses: Vec<&ToolUseBlock> = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse(tu) => Some(tu),
            _ => None,
        })
        .collect();

    if tool_uses.is_empty() {
        return vec![ChatMessage::new(ChatRole::Assistant, Some(map_content(blocks)))];
    }

    // 文本和思考按输入顺序拼接，工具调用放到 tool_calls
    let text = blocks
        .iter()
        .filter_map(block_text)
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut assistant = ChatMessage::new(
        ChatRole::Assistant,
        (!text.is_empty()).then(|| ChatContent::Text(text)),
    );
    assistant.tool_calls = Some(
        tool_uses
            .into_iter()
            .map(|tu| ToolCall {
                id: tu.id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: tu.name.clone(),
                    arguments: tu.input.to_string(),
                },
            })
            .collect(),
    );
    vec![assistant]
}

/// 文本类块的文本：text / thinking，未知块取其 `text` 字段
fn block_text(block: &ContentBlock) -> Option<&str> {
    match block {
        ContentBlock::Text(t) => Some(t.text.as_str()),
        ContentBlock::Thinking(t) => Some(t.thinking.as_str()),
        ContentBlock::Unknown(v) => {
            let text = v.get("text").and_then(Value::as_str);
            if text.is_none() {
                debug!(block_type = ?v.get("type"), "Dropping unsupported content block");
            }
            text
        }
        _ => None,
    }
}

/// 没有图片时拼成纯文本，有图片时输出 parts
fn map_content(blocks: &[ContentBlock]) -> ChatContent {
    let has_image = blocks.iter().any(|b| matches!(b, ContentBlock::Image(_)));
    if !has_image {
        let text = blocks.iter().filter_map(block_text).collect::<Vec<_>>().join("\n\n");
        return ChatContent::Text(text);
    }

    let parts = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Image(image) => image.source.url().map(|url| ContentPart::ImageUrl {
                image_url: ImageUrl { url, detail: None },
            }),
            other => block_text(other).map(|text| ContentPart::Text {
                text: text.to_string(),
            }),
        })
        .collect();
    ChatContent::Parts(parts)
}

fn translate_tools(tools: &[AnthropicTool]) -> Vec<ChatTool> {
    tools
        .iter()
        .map(|tool| ChatTool {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            },
        })
        .collect()
}

fn translate_tool_choice(choice: &AnthropicToolChoice) -> Option<ChatToolChoice> {
    match choice.kind.as_str() {
        "auto" => Some(ChatToolChoice::Mode("auto".to_string())),
        "any" => Some(ChatToolChoice::Mode("required".to_string())),
        "none" => Some(ChatToolChoice::Mode("none".to_string())),
        "tool" => choice.name.as_ref().map(|name| ChatToolChoice::Function {
            choice_type: "function".to_string(),
            function: NamedFunction { name: name.clone() },
        }),
        _ => None,
    }
}

// ================== 响应: Chat -> Anthropic ==================

pub fn translate_to_anthropic(response: ChatCompletionResponse) -> AnthropicResponse {
    let mut text_blocks = Vec::new();
    let mut tool_blocks = Vec::new();

    for choice in &response.choices {
        match &choice.message.content {
            Some(ChatContent::Text(text)) => text_blocks.push(ContentBlock::text(text.clone())),
            Some(ChatContent::Parts(parts)) => {
                text_blocks.extend(parts.iter().filter_map(|p| match p {
                    ContentPart::Text { text } => Some(ContentBlock::text(text.clone())),
                    _ => None,
                }))
            }
            None => {}
        }

        for call in choice.message.tool_calls.iter().flatten() {
            tool_blocks.push(ContentBlock::ToolUse(ToolUseBlock {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input: parse_function_call_arguments(&call.function.arguments),
                cache_control: None,
                extra: Map::new(),
            }));
        }
    }

    text_blocks.extend(tool_blocks);

    let mut result = AnthropicResponse::new(response.id.clone(), response.model.clone(), text_blocks);
    result.stop_reason = map_openai_stop_reason(combined_finish_reason(&response));
    result.usage = usage_from_chat(response.usage.as_ref());
    result
}

/// 多个 choice 时：任一 tool_calls 优先，否则取第一个非空 finish_reason
fn combined_finish_reason(response: &ChatCompletionResponse) -> Option<&str> {
    let reasons = response.choices.iter().filter_map(|c| c.finish_reason.as_deref());
    let mut first = None;
    for reason in reasons {
        if reason == "tool_calls" {
            return Some(reason);
        }
        first.get_or_insert(reason);
    }
    first
}

// ================== 适配器 ==================

pub struct ChatAdapter;

impl ProtocolAdapter for ChatAdapter {
    fn endpoint(&self) -> UpstreamEndpoint {
        UpstreamEndpoint::ChatCompletions
    }

    fn transform_request(&self, payload: &AnthropicMessagesPayload) -> Result<Value> {
        Ok(serde_json::to_value(translate_to_openai(payload))?)
    }

    fn request_options(&self, upstream_payload: &Value) -> RequestOptions {
        crate::preprocess::chat::request_options(upstream_payload)
    }

    fn transform_response(&self, body: &[u8]) -> Result<AnthropicResponse> {
        let response: ChatCompletionResponse = serde_json::from_slice(body)?;
        Ok(translate_to_anthropic(response))
    }

    fn transform_stream(&self, records: SseStream) -> ByteStream {
        crate::stream::chat_to_anthropic(records)
    }
}
