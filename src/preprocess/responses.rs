//! Responses 入站请求的整形与附加选项

use crate::models::{Initiator, RequestOptions};
use serde_json::{json, Value};
use tracing::debug;

const APPLY_PATCH: &str = "apply_patch";

/// 推断上游附加选项：
/// 任意层级出现 input_image 即为 vision；最后一个输入项没有 role 或来自 assistant 即为 agent 发起
pub fn request_options(payload: &Value) -> RequestOptions {
    let input = payload.get("input");
    let vision = input.map(contains_input_image).unwrap_or(false);

    let initiator = match input.and_then(Value::as_array).and_then(|items| items.last()) {
        Some(last) => match last.get("role").and_then(Value::as_str) {
            None | Some("assistant") => Initiator::Agent,
            Some(_) => Initiator::User,
        },
        None => Initiator::User,
    };

    RequestOptions {
        vision,
        initiator: Some(initiator),
        anthropic_beta: None,
    }
}

fn contains_input_image(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().any(contains_input_image),
        Value::Object(object) => {
            object.get("type").and_then(Value::as_str) == Some("input_image")
                || object.get("content").map(contains_input_image).unwrap_or(false)
        }
        _ => false,
    }
}

/// 工具列表整形：自定义 apply_patch 改写为函数工具，移除 web_search
pub fn rewrite_tools(payload: &mut Value) {
    let Some(tools) = payload.get_mut("tools").and_then(Value::as_array_mut) else {
        return;
    };

    tools.retain(|tool| tool.get("type").and_then(Value::as_str) != Some("web_search"));

    for tool in tools.iter_mut() {
        let is_custom_patch = tool.get("type").and_then(Value::as_str) == Some("custom")
            && tool.get("name").and_then(Value::as_str) == Some(APPLY_PATCH);
        if is_custom_patch {
            debug!("Rewriting custom apply_patch tool as function tool");
            *tool = apply_patch_function();
        }
    }
}

fn apply_patch_function() -> Value {
    json!({
        "type": "function",
        "name": APPLY_PATCH,
        "description": "Use the `apply_patch` tool to edit files",
        "parameters": {
            "type": "object",
            "properties": {
                "input": {
                    "type": "string",
                    "description": "The entire contents of the apply_patch command"
                }
            },
            "required": ["input"]
        },
        "strict": false
    })
}
