//! Anthropic Messages 与 OpenAI 两种方言之间的非流式转换
//!
//! 这里都是纯函数：不做IO，不读全局状态。流式转换见 `crate::stream`。

pub mod chat;
pub mod responses;

use crate::protocol::anthropic::{AnthropicUsage, StopReason};
use crate::protocol::openai::ChatUsage;
use crate::protocol::responses::ResponsesUsage;
use serde_json::{json, Map, Value};
use tracing::warn;

pub use chat::ChatAdapter;
pub use responses::ResponsesAdapter;

/// 占位思考文本：上游给了加密推理但没有可读摘要时使用
pub const THINKING_TEXT: &str = "Thinking...";

/// OpenAI finish_reason -> Anthropic stop_reason
///
/// 对任意输入都有定义，未知值返回 None
pub fn map_openai_stop_reason(reason: Option<&str>) -> Option<StopReason> {
    match reason? {
        "stop" => Some(StopReason::EndTurn),
        "length" => Some(StopReason::MaxTokens),
        "tool_calls" => Some(StopReason::ToolUse),
        "content_filter" => Some(StopReason::EndTurn),
        _ => None,
    }
}

/// Chat usage -> Anthropic usage
///
/// input_tokens 不包含缓存命中部分；只有上游报告了缓存数才输出 cache_read_input_tokens
pub fn usage_from_chat(usage: Option<&ChatUsage>) -> AnthropicUsage {
    let Some(usage) = usage else {
        return AnthropicUsage::default();
    };
    let cached = usage.cached_tokens();
    AnthropicUsage {
        input_tokens: usage.prompt_tokens.saturating_sub(cached.unwrap_or(0)),
        output_tokens: usage.completion_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: cached,
    }
}

/// Responses usage -> Anthropic usage，规则同 `usage_from_chat`
pub fn usage_from_responses(usage: Option<&ResponsesUsage>) -> AnthropicUsage {
    let Some(usage) = usage else {
        return AnthropicUsage::default();
    };
    let cached = usage.cached_tokens();
    AnthropicUsage {
        input_tokens: usage.input_tokens.saturating_sub(cached.unwrap_or(0)),
        output_tokens: usage.output_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: cached,
    }
}

/// 把加密推理内容和推理项ID编码进 Anthropic thinking 块的 signature
pub fn encode_signature(encrypted_content: &str, id: &str) -> String {
    format!("{}@{}", encrypted_content, id)
}

/// `encode_signature` 的逆操作，按第一个 `@` 切分
///
/// 没有 `@` 的 signature 属于原生 Anthropic 签名，返回 None
pub fn decode_signature(signature: &str) -> Option<(&str, &str)> {
    signature.split_once('@')
}

/// 解析函数调用参数字符串，保证得到一个JSON对象
///
/// - 空串 -> `{}`
/// - 对象 -> 原样
/// - 数组 -> `{"arguments": [...]}`
/// - 其它（标量或非法JSON） -> `{"raw_arguments": "<原文>"}`
pub fn parse_function_call_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(Value::Array(items)) => json!({ "arguments": items }),
        Ok(_) => {
            warn!(raw = %raw, "Function call arguments is not an object");
            json!({ "raw_arguments": raw })
        }
        Err(e) => {
            warn!(error = %e, raw = %raw, "Failed to parse function call arguments");
            json!({ "raw_arguments": raw })
        }
    }
}

/// 归一化 Claude 带日期后缀的模型名，用于 Chat Completions 上游
pub fn normalize_model_name(model: &str) -> String {
    if model.starts_with("claude-sonnet-4-") {
        return "claude-sonnet-4".to_string();
    }
    if model.starts_with("claude-opus-4-") {
        return "claude-opus-4".to_string();
    }
    model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::openai::PromptTokensDetails;

    #[test]
    fn stop_reason_mapping_is_total() {
        assert_eq!(map_openai_stop_reason(Some("stop")), Some(StopReason::EndTurn));
        assert_eq!(map_openai_stop_reason(Some("length")), Some(StopReason::MaxTokens));
        assert_eq!(map_openai_stop_reason(Some("tool_calls")), Some(StopReason::ToolUse));
        assert_eq!(map_openai_stop_reason(Some("content_filter")), Some(StopReason::EndTurn));
        assert_eq!(map_openai_stop_reason(Some("function_call")), None);
        assert_eq!(map_openai_stop_reason(Some("")), None);
        assert_eq!(map_openai_stop_reason(None), None);
    }

    #[test]
    fn usage_subtracts_cached_tokens() {
        let usage = ChatUsage {
            prompt_tokens: 100,
            completion_tokens: 7,
            total_tokens: 107,
            prompt_tokens_details: Some(PromptTokensDetails {
                cached_tokens: Some(30),
            }),
        };
        let mapped = usage_from_chat(Some(&usage));
        assert_eq!(mapped.input_tokens, 70);
        assert_eq!(mapped.output_tokens, 7);
        assert_eq!(mapped.cache_read_input_tokens, Some(30));
    }

    #[test]
    fn usage_without_cache_details_omits_cache_field() {
        let usage = ChatUsage {
            prompt_tokens: 100,
            completion_tokens: 7,
            total_tokens: 107,
            prompt_tokens_details: None,
        };
        let mapped = usage_from_chat(Some(&usage));
        assert_eq!(mapped.input_tokens, 100);
        let value = serde_json::to_value(&mapped).unwrap();
        assert!(value.get("cache_read_input_tokens").is_none());
    }

    #[test]
    fn usage_never_underflows() {
        let usage = ResponsesUsage {
            input_tokens: 10,
            output_tokens: 0,
            total_tokens: 10,
            input_tokens_details: Some(crate::protocol::responses::InputTokensDetails {
                cached_tokens: Some(50),
            }),
        };
        assert_eq!(usage_from_responses(Some(&usage)).input_tokens, 0);
    }

    #[test]
    fn signature_round_trip_splits_on_first_at() {
        let sig = encode_signature("enc@with@ats", "rs_1");
        assert_eq!(sig, "enc@with@ats@rs_1");
        assert_eq!(decode_signature("abc@rs_1"), Some(("abc", "rs_1")));
        assert_eq!(decode_signature("native-signature"), None);
    }

    #[test]
    fn argument_parsing_always_yields_object() {
        assert_eq!(parse_function_call_arguments(""), json!({}));
        assert_eq!(parse_function_call_arguments("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_function_call_arguments("[1,2]"), json!({"arguments": [1, 2]}));
        assert_eq!(parse_function_call_arguments("42"), json!({"raw_arguments": "42"}));
        assert_eq!(parse_function_call_arguments("{oops"), json!({"raw_arguments": "{oops"}));
    }

    #[test]
    fn normalizes_dated_claude_names() {
        assert_eq!(normalize_model_name("claude-sonnet-4-20250514"), "claude-sonnet-4");
        assert_eq!(normalize_model_name("claude-opus-4-1"), "claude-opus-4");
        assert_eq!(normalize_model_name("claude-sonnet-4"), "claude-sonnet-4");
        assert_eq!(normalize_model_name("gpt-4o"), "gpt-4o");
    }
}
