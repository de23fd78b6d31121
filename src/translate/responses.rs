//! Anthropic Messages <-> OpenAI Responses

use super::{decode_signature, encode_signature, parse_function_call_arguments, usage_from_responses, THINKING_TEXT};
use crate::error::Result;
use crate::models::{RequestOptions, UpstreamEndpoint};
use crate::protocol::anthropic::{
    AnthropicMessage, AnthropicMessagesPayload, AnthropicResponse, AnthropicTool, AnthropicToolChoice,
    ContentBlock, ImageBlock, MessageContent, Metadata, Role, StopReason, SystemPrompt, ThinkingBlock,
    ToolResultBlock, ToolResultContent, ToolUseBlock,
};
use crate::protocol::responses::{
    FunctionCallItem, InputContent, InputMessageContent, OutputContent, ReasoningConfig, ReasoningItem,
    ResponseInputItem, ResponseOutputItem, ResponsesPayload, ResponsesResult, ResponsesTool,
    ResponsesToolChoice, SummaryText,
};
use crate::protocol::{ByteStream, ProtocolAdapter, SseStream};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

/// 推理模型要求的最小输出预算
const MIN_OUTPUT_TOKENS: u32 = 12800;

/// 需要在 assistant 消息上标注 phase 的模型
const CODEX_PHASE_MODEL: &str = "gpt-5.3-codex";

static USER_ID_ACCOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"user_([^_]+)_account").expect("static regex"));
static USER_ID_SESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_session_(.+)$").expect("static regex"));

// ================== 请求: Anthropic -> Responses ==================

pub fn translate_to_responses(payload: &AnthropicMessagesPayload) -> ResponsesPayload {
    let input = payload
        .messages
        .iter()
        .flat_map(|message| match message.role {
            Role::User => translate_user_message(message),
            Role::Assistant => translate_assistant_message(message, &payload.model),
        })
        .collect();

    let (safety_identifier, prompt_cache_key) = parse_user_id(payload.metadata.as_ref());

    ResponsesPayload {
        model: payload.model.clone(),
        input,
        instructions: payload.system.as_ref().and_then(translate_system),
        temperature: Some(1.0),
        top_p: payload.top_p,
        max_output_tokens: Some(payload.max_tokens.max(MIN_OUTPUT_TOKENS)),
        tools: payload.tools.as_deref().and_then(translate_tools),
        tool_choice: Some(translate_tool_choice(payload.tool_choice.as_ref())),
        metadata: payload
            .metadata
            .as_ref()
            .and_then(|m| serde_json::to_value(m).ok())
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            }),
        safety_identifier,
        prompt_cache_key,
        stream: payload.stream,
        store: false,
        parallel_tool_calls: true,
        reasoning: Some(ReasoningConfig {
            effort: "high".to_string(),
            summary: "detailed".to_string(),
        }),
        include: vec!["reasoning.encrypted_content".to_string()],
    }
}

fn translate_system(system: &SystemPrompt) -> Option<String> {
    let text = match system {
        SystemPrompt::Text(text) => text.clone(),
        SystemPrompt::Blocks(_) => system.texts().join(" "),
    };
    (!text.is_empty()).then_some(text)
}

/// 连续的非工具内容合并成一个 message 项，遇到工具项时先冲刷
struct PendingMessage<'a> {
    role: &'static str,
    phase: Option<&'a str>,
    parts: Vec<InputContent>,
}

impl<'a> PendingMessage<'a> {
    fn new(role: &'static str, phase: Option<&'a str>) -> Self {
        Self {
            role,
            phase,
            parts: Vec::new(),
        }
    }

    fn flush_into(&mut self, items: &mut Vec<ResponseInputItem>) {
        if self.parts.is_empty() {
            return;
        }
        items.push(ResponseInputItem::Message {
            role: self.role.to_string(),
            content: InputMessageContent::Parts(std::mem::take(&mut self.parts)),
            phase: self.phase.map(str::to_string),
        });
    }
}

fn translate_user_message(message: &AnthropicMessage) -> Vec<ResponseInputItem> {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            return vec![ResponseInputItem::Message {
                role: "user".to_string(),
                content: InputMessageContent::Text(text.clone()),
                phase: None,
            }]
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut items = Vec::new();
    let mut pending = PendingMessage::new("user", None);

    for block in blocks {
        match block {
            ContentBlock::ToolResult(result) => {
                pending.flush_into(&mut items);
                items.push(function_call_output(result));
            }
            ContentBlock::Text(t) => pending.parts.push(InputContent::InputText { text: t.text.clone() }),
            ContentBlock::Image(image) => pending.parts.extend(input_image(image)),
            _ => {}
        }
    }

    pending.flush_into(&mut items);
    items
}

fn translate_assistant_message(message: &AnthropicMessage, model: &str) -> Vec<ResponseInputItem> {
    let phase = assistant_phase(model, &message.content);

    let blocks = match &message.content {
        MessageContent::Text(text) => {
            return vec![ResponseInputItem::Message {
                role: "assistant".to_string(),
                content: InputMessageContent::Text(text.clone()),
                phase: phase.map(str::to_string),
            }]
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut items = Vec::new();
    let mut pending = PendingMessage::new("assistant", phase);

    for block in blocks {
        match block {
            ContentBlock::ToolUse(tool_use) => {
                pending.flush_into(&mut items);
                items.push(function_call(tool_use));
            }
            ContentBlock::Thinking(thinking) => {
                // 只有网关自己签发的 signature 才能还原成推理项，其余思考块丢弃
                if let Some(item) = reasoning_item(thinking) {
                    pending.flush_into(&mut items);
                    items.push(item);
                }
            }
            ContentBlock::Text(t) => pending.parts.push(InputContent::OutputText { text: t.text.clone() }),
            _ => {}
        }
    }

    pending.flush_into(&mut items);
    items
}

fn assistant_phase(model: &str, content: &MessageContent) -> Option<&'static str> {
    if model != CODEX_PHASE_MODEL {
        return None;
    }
    match content {
        MessageContent::Text(_) => Some("final_answer"),
        MessageContent::Blocks(blocks) => {
            let has_text = blocks.iter().any(|b| matches!(b, ContentBlock::Text(_)));
            if !has_text {
                return None;
            }
            let has_tool_use = blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse(_)));
            Some(if has_tool_use { "commentary" } else { "final_answer" })
        }
    }
}

/// 不能表示成 URL 的图片来源被丢弃
fn input_image(image: &ImageBlock) -> Option<InputContent> {
    let Some(image_url) = image.source.url() else {
        debug!("Dropping image with unsupported source");
        return None;
    };
    Some(InputContent::InputImage {
        image_url,
        detail: "auto".to_string(),
    })
}

fn reasoning_item(block: &ThinkingBlock) -> Option<ResponseInputItem> {
    let (encrypted_content, id) = decode_signature(&block.signature)?;
    let summary = if block.thinking.is_empty() || block.thinking == THINKING_TEXT {
        Vec::new()
    } else {
        vec![SummaryText::new(block.thinking.clone())]
    };
    Some(ResponseInputItem::Reasoning {
        id: id.to_string(),
        summary,
        encrypted_content: encrypted_content.to_string(),
    })
}

fn function_call(block: &ToolUseBlock) -> ResponseInputItem {
    ResponseInputItem::FunctionCall {
        call_id: block.id.clone(),
        name: block.name.clone(),
        arguments: block.input.to_string(),
        status: "completed".to_string(),
    }
}

fn function_call_output(block: &ToolResultBlock) -> ResponseInputItem {
    let output = match &block.content {
        ToolResultContent::Text(text) => InputMessageContent::Text(text.clone()),
        ToolResultContent::Blocks(blocks) => InputMessageContent::Parts(
            blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text(t) => Some(InputContent::InputText { text: t.text.clone() }),
                    ContentBlock::Image(image) => input_image(image),
                    _ => None,
                })
                .collect(),
        ),
    };
    let status = if block.is_error.unwrap_or(false) {
        "incomplete"
    } else {
        "completed"
    };
    ResponseInputItem::FunctionCallOutput {
        call_id: block.tool_use_id.clone(),
        output,
        status: Some(status.to_string()),
    }
}

fn translate_tools(tools: &[AnthropicTool]) -> Option<Vec<ResponsesTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| ResponsesTool {
                tool_type: "function".to_string(),
                name: tool.name.clone(),
                description: tool.description.clone().filter(|d| !d.is_empty()),
                parameters: tool.input_schema.clone().unwrap_or(Value::Null),
                strict: false,
            })
            .collect(),
    )
}

fn translate_tool_choice(choice: Option<&AnthropicToolChoice>) -> ResponsesToolChoice {
    let mode = |m: &str| ResponsesToolChoice::Mode(m.to_string());
    let Some(choice) = choice else {
        return mode("auto");
    };
    match (choice.kind.as_str(), &choice.name) {
        ("any", _) => mode("required"),
        ("none", _) => mode("none"),
        ("tool", Some(name)) => ResponsesToolChoice::Function {
            choice_type: "function".to_string(),
            name: name.clone(),
        },
        _ => mode("auto"),
    }
}

/// 从 `user_<id>_account..._session_<key>` 形式的 user_id 中提取标识
fn parse_user_id(metadata: Option<&Metadata>) -> (Option<String>, Option<String>) {
    let Some(user_id) = metadata.and_then(|m| m.user_id.as_deref()) else {
        return (None, None);
    };
    let capture = |re: &Regex| {
        re.captures(user_id)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };
    (capture(&USER_ID_ACCOUNT), capture(&USER_ID_SESSION))
}

// ================== 响应: Responses -> Anthropic ==================

pub fn translate_result(result: &ResponsesResult) -> AnthropicResponse {
    let mut content = output_to_content(&result.output);
    if content.is_empty() && !result.output_text.is_empty() {
        content.push(ContentBlock::text(result.output_text.clone()));
    }

    let mut response = AnthropicResponse::new(result.id.clone(), result.model.clone(), content);
    response.stop_reason = stop_reason(result);
    response.usage = usage_from_responses(result.usage.as_ref());
    response
}

fn output_to_content(output: &[ResponseOutputItem]) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    for item in output {
        match item {
            ResponseOutputItem::Reasoning(reasoning) => {
                let thinking = reasoning_text(reasoning);
                if !thinking.is_empty() {
                    let signature = encode_signature(
                        reasoning.encrypted_content.as_deref().unwrap_or_default(),
                        &reasoning.id,
                    );
                    blocks.push(ContentBlock::Thinking(ThinkingBlock::new(thinking, signature)));
                }
            }
            ResponseOutputItem::FunctionCall(call) => {
                if let Some(block) = tool_use_block(call) {
                    blocks.push(block);
                }
            }
            ResponseOutputItem::Message(message) => {
                let text: String = message.content.iter().filter_map(OutputContent::text).collect();
                if !text.is_empty() {
                    blocks.push(ContentBlock::text(text));
                }
            }
            ResponseOutputItem::Other(value) => {
                let text = other_item_text(value);
                if !text.is_empty() {
                    blocks.push(ContentBlock::text(text));
                }
            }
        }
    }

    blocks
}

/// 推理摘要文本；没有摘要时返回占位文本
pub fn reasoning_text(item: &ReasoningItem) -> String {
    if item.summary.is_empty() {
        return THINKING_TEXT.to_string();
    }
    item.summary
        .iter()
        .map(|s| s.text.as_str())
        .collect::<String>()
        .trim()
        .to_string()
}

fn tool_use_block(call: &FunctionCallItem) -> Option<ContentBlock> {
    let (Some(call_id), Some(name)) = (&call.call_id, &call.name) else {
        return None;
    };
    if call_id.is_empty() || name.is_empty() {
        return None;
    }
    Some(ContentBlock::ToolUse(ToolUseBlock {
        id: call_id.clone(),
        name: name.clone(),
        input: parse_function_call_arguments(&call.arguments),
        cache_control: None,
        extra: Map::new(),
    }))
}

fn other_item_text(value: &Value) -> String {
    let Some(parts) = value.get("content").and_then(Value::as_array) else {
        return String::new();
    };
    parts
        .iter()
        .filter_map(|part| {
            serde_json::from_value::<OutputContent>(part.clone())
                .ok()
                .and_then(|c| c.text().map(str::to_string))
        })
        .collect()
}

pub fn stop_reason(result: &ResponsesResult) -> Option<StopReason> {
    match result.status.as_str() {
        "completed" => {
            let has_call = result
                .output
                .iter()
                .any(|item| matches!(item, ResponseOutputItem::FunctionCall(_)));
            Some(if has_call { StopReason::ToolUse } else { StopReason::EndTurn })
        }
        "incomplete" => match result.incomplete_details.as_ref().and_then(|d| d.reason.as_deref()) {
            Some("max_output_tokens") => Some(StopReason::MaxTokens),
            Some("content_filter") => Some(StopReason::EndTurn),
            _ => None,
        },
        _ => None,
    }
}

// ================== 适配器 ==================

pub struct ResponsesAdapter;

impl ProtocolAdapter for ResponsesAdapter {
    fn endpoint(&self) -> UpstreamEndpoint {
        UpstreamEndpoint::Responses
    }

    fn transform_request(&self, payload: &AnthropicMessagesPayload) -> Result<Value> {
        Ok(serde_json::to_value(translate_to_responses(payload))?)
    }

    fn request_options(&self, upstream_payload: &Value) -> RequestOptions {
        crate::preprocess::responses::request_options(upstream_payload)
    }

    fn transform_response(&self, body: &[u8]) -> Result<AnthropicResponse> {
        let result: ResponsesResult = serde_json::from_slice(body)?;
        Ok(translate_result(&result))
    }

    fn transform_stream(&self, records: SseStream) -> ByteStream {
        crate::stream::responses_to_anthropic(records)
    }
}
