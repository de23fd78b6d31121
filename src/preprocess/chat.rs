//! Chat Completions 入站请求的整形与附加选项

use crate::models::{Initiator, ModelInfo, RequestOptions};
use serde_json::Value;
use tracing::debug;

/// 推断上游附加选项：
/// 任一消息包含 image_url 片段即为 vision；最后一条消息来自 assistant 或 tool 即为 agent 发起
pub fn request_options(payload: &Value) -> RequestOptions {
    let messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let vision = messages.iter().any(|message| {
        message
            .get("content")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .any(|part| part.get("type").and_then(Value::as_str) == Some("image_url"))
            })
            .unwrap_or(false)
    });

    let initiator = match messages
        .last()
        .and_then(|m| m.get("role"))
        .and_then(Value::as_str)
    {
        Some("assistant") | Some("tool") => Initiator::Agent,
        _ => Initiator::User,
    };

    RequestOptions {
        vision,
        initiator: Some(initiator),
        anthropic_beta: None,
    }
}

/// max_tokens 缺省时用目录中的模型输出上限补上
pub fn fill_max_tokens(payload: &mut Value, model: Option<&ModelInfo>) {
    let missing = payload.get("max_tokens").map(Value::is_null).unwrap_or(true);
    if !missing {
        return;
    }
    if let (Some(limit), Some(object)) = (model.and_then(ModelInfo::max_output_tokens), payload.as_object_mut()) {
        debug!(max_tokens = limit, "Filling max_tokens from model catalog");
        object.insert("max_tokens".to_string(), Value::from(limit));
    }
}
