//! Anthropic Messages 入站请求的整形
//!
//! 这些规则只作用于 /v1/messages 路径，在路由和翻译之前执行。

use crate::models::{Initiator, ModelInfo, RequestOptions};
use crate::protocol::anthropic::{
    AnthropicMessagesPayload, ContentBlock, MessageContent, Role, TextBlock,
    ThinkingConfig, ToolResultBlock, ToolResultContent,
};
use crate::translate::THINKING_TEXT;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Map;
use tracing::debug;

/// 上下文压缩请求的系统提示开头
pub const COMPACT_SYSTEM_PROMPT_START: &str =
    "You are a helpful AI assistant tasked with summarizing conversations";

pub const SUBAGENT_MARKER: &str = "__SUBAGENT_MARKER__";

static SYSTEM_REMINDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<system-reminder>([\s\S]*?)</system-reminder>").expect("static regex"));

/// 预处理的结论
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preprocessed {
    pub is_compact: bool,
    /// 子代理请求强制使用 agent 发起方
    pub initiator_override: Option<Initiator>,
}

/// 依次执行：子代理标记检测、compact 检测、warmup / compact 模型替换、工具结果合并
pub fn preprocess(
    payload: &mut AnthropicMessagesPayload,
    anthropic_beta: Option<&str>,
    small_fast_model: Option<&str>,
) -> Preprocessed {
    let initiator_override = has_subagent_marker(payload).then_some(Initiator::Agent);
    if initiator_override.is_some() {
        debug!("Detected subagent marker");
    }

    let is_compact = is_compact_request(payload);

    if let Some(small) = small_fast_model {
        if is_warmup_request(payload, anthropic_beta, is_compact) {
            debug!(from = %payload.model, to = %small, "Warmup request, switching model");
            payload.model = small.to_string();
        } else if is_compact {
            debug!(from = %payload.model, to = %small, "Compact request, switching model");
            payload.model = small.to_string();
        }
    }

    if !is_compact {
        merge_tool_results(payload);
    }

    Preprocessed {
        is_compact,
        initiator_override,
    }
}

pub fn is_compact_request(payload: &AnthropicMessagesPayload) -> bool {
    match &payload.system {
        Some(system) => system
            .texts()
            .iter()
            .any(|text| text.starts_with(COMPACT_SYSTEM_PROMPT_START)),
        None => false,
    }
}

/// 带 anthropic-beta header 且没有工具的非 compact 请求视为 warmup
pub fn is_warmup_request(payload: &AnthropicMessagesPayload, anthropic_beta: Option<&str>, is_compact: bool) -> bool {
    anthropic_beta.is_some() && !payload.has_tools() && !is_compact
}

/// 第一条 user 消息的 `<system-reminder>` 中是否带有子代理标记
pub fn has_subagent_marker(payload: &AnthropicMessagesPayload) -> bool {
    let Some(first_user) = payload.messages.iter().find(|m| m.role == Role::User) else {
        return false;
    };

    match &first_user.content {
        MessageContent::Text(text) => contains_marker(text),
        MessageContent::Blocks(blocks) => blocks.iter().any(|block| match block {
            ContentBlock::Text(t) => contains_marker(&t.text),
            _ => false,
        }),
    }
}

fn contains_marker(text: &str) -> bool {
    if !text.contains(SUBAGENT_MARKER) {
        return false;
    }
    SYSTEM_REMINDER
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|reminder| reminder.as_str().contains(SUBAGENT_MARKER))
        .unwrap_or(false)
}

/// 把同一条 user 消息里的文本块并入工具结果，避免按一次新的用户轮次计费
///
/// 只处理仅由 tool_result 和 text 组成、且两者都存在的消息。
/// 数量相等时一一对应，否则全部追加到最后一个 tool_result。
pub fn merge_tool_results(payload: &mut AnthropicMessagesPayload) {
    for message in payload.messages.iter_mut().filter(|m| m.role == Role::User) {
        let MessageContent::Blocks(blocks) = &message.content else {
            continue;
        };

        let mut results: Vec<ToolResultBlock> = Vec::new();
        let mut texts: Vec<TextBlock> = Vec::new();
        let mut mergeable = true;
        for block in blocks {
            match block {
                ContentBlock::ToolResult(r) => results.push(r.clone()),
                ContentBlock::Text(t) => texts.push(t.clone()),
                _ => {
                    mergeable = false;
                    break;
                }
            }
        }
        if !mergeable || results.is_empty() || texts.is_empty() {
            continue;
        }

        let merged: Vec<ToolResultBlock> = if results.len() == texts.len() {
            results
                .into_iter()
                .zip(texts)
                .map(|(result, text)| append_texts(result, vec![text]))
                .collect()
        } else {
            let mut results = results;
            if let Some(last) = results.pop() {
                results.push(append_texts(last, texts));
            }
            results
        };

        message.content = MessageContent::Blocks(merged.into_iter().map(ContentBlock::ToolResult).collect());
    }
}

fn append_texts(mut result: ToolResultBlock, texts: Vec<TextBlock>) -> ToolResultBlock {
    result.content = match result.content {
        ToolResultContent::Text(existing) => {
            let appended = texts.iter().map(|t| t.text.as_str()).collect::<Vec<_>>().join("\n\n");
            ToolResultContent::Text(format!("{}\n\n{}", existing, appended))
        }
        ToolResultContent::Blocks(mut blocks) => {
            blocks.extend(texts.into_iter().map(ContentBlock::Text));
            ToolResultContent::Blocks(blocks)
        }
    };
    result
}

/// 原生 Messages 转发前过滤思考块
///
/// 只保留上游自己签发的思考块：有文本、不是占位文本、有签名且签名不含 `@`
pub fn filter_thinking_blocks(payload: &mut AnthropicMessagesPayload) {
    for message in payload.messages.iter_mut().filter(|m| m.role == Role::Assistant) {
        if let MessageContent::Blocks(blocks) = &mut message.content {
            blocks.retain(|block| match block {
                ContentBlock::Thinking(t) => {
                    !t.thinking.is_empty()
                        && t.thinking != THINKING_TEXT
                        && !t.signature.is_empty()
                        && !t.signature.contains('@')
                }
                _ => true,
            });
        }
    }
}

/// 支持自适应思考的模型统一使用 adaptive + high effort
pub fn apply_adaptive_thinking(payload: &mut AnthropicMessagesPayload, model: Option<&ModelInfo>) {
    if model.map(|m| m.supports_adaptive_thinking()).unwrap_or(false) {
        payload.thinking = Some(ThinkingConfig {
            kind: "adaptive".to_string(),
            budget_tokens: None,
            extra: Map::new(),
        });
        let mut output_config = payload.output_config.take().unwrap_or_default();
        output_config.effort = Some("high".to_string());
        payload.output_config = Some(output_config);
    }
}

/// 原生 Messages 转发的附加选项
///
/// 最后一条消息来自 assistant 或带有 tool_result 时视为 agent 发起
pub fn native_request_options(
    payload: &AnthropicMessagesPayload,
    initiator_override: Option<Initiator>,
    anthropic_beta: Option<&str>,
) -> RequestOptions {
    let vision = payload.messages.iter().any(|message| match &message.content {
        MessageContent::Blocks(blocks) => blocks.iter().any(|b| matches!(b, ContentBlock::Image(_))),
        MessageContent::Text(_) => false,
    });

    let inferred = match payload.messages.last() {
        Some(last) if last.role == Role::Assistant => Initiator::Agent,
        Some(last) => match &last.content {
            MessageContent::Blocks(blocks) if blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult(_))) => {
                Initiator::Agent
            }
            _ => Initiator::User,
        },
        None => Initiator::User,
    };

    RequestOptions {
        vision,
        initiator: Some(initiator_override.unwrap_or(inferred)),
        anthropic_beta: anthropic_beta.map(str::to_string),
    }
}
