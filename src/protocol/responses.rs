//! OpenAI Responses 协议类型
//!
//! 入站 Responses 请求按 JSON 透传；这里的类型用于 Messages -> Responses 的请求构造、
//! 上游结果的解析以及流式事件的解码。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesPayload {
    pub model: String,
    pub input: Vec<ResponseInputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ResponsesTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ResponsesToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    pub store: bool,
    pub parallel_tool_calls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub effort: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseInputItem {
    Message {
        role: String,
        content: InputMessageContent,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
        status: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: InputMessageContent,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    Reasoning {
        id: String,
        summary: Vec<SummaryText>,
        encrypted_content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputMessageContent {
    Text(String),
    Parts(Vec<InputContent>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputContent {
    InputText { text: String },
    OutputText { text: String },
    InputImage { image_url: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryText {
    #[serde(rename = "type", default = "summary_text_type")]
    pub summary_type: String,
    pub text: String,
}

fn summary_text_type() -> String {
    "summary_text".to_string()
}

impl SummaryText {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            summary_type: summary_text_type(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsesTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsesToolChoice {
    /// auto | none | required
    Mode(String),
    Function {
        #[serde(rename = "type")]
        choice_type: String,
        name: String,
    },
}

// ================== 结果 ==================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsesResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: Vec<ResponseOutputItem>,
    #[serde(default)]
    pub output_text: String,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    pub usage: Option<ResponsesUsage>,
    #[serde(default)]
    pub error: Option<ResponsesError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsesUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens_details: Option<InputTokensDetails>,
}

impl ResponsesUsage {
    pub fn cached_tokens(&self) -> Option<u64> {
        self.input_tokens_details.as_ref().and_then(|d| d.cached_tokens)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputTokensDetails {
    #[serde(default)]
    pub cached_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsesError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub summary: Vec<SummaryText>,
    #[serde(default)]
    pub encrypted_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Vec<OutputContent>,
}

/// 上游结果中的一个输出项
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutputItem {
    Reasoning(ReasoningItem),
    FunctionCall(FunctionCallItem),
    Message(MessageItem),
    /// 其它类型（web_search_call 等），保留原始 JSON
    Other(Value),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedOutputRef<'a> {
    Reasoning(&'a ReasoningItem),
    FunctionCall(&'a FunctionCallItem),
    Message(&'a MessageItem),
}

impl Serialize for ResponseOutputItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ResponseOutputItem::Reasoning(i) => TaggedOutputRef::Reasoning(i).serialize(serializer),
            ResponseOutputItem::FunctionCall(i) => TaggedOutputRef::FunctionCall(i).serialize(serializer),
            ResponseOutputItem::Message(i) => TaggedOutputRef::Message(i).serialize(serializer),
            ResponseOutputItem::Other(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ResponseOutputItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let item = match kind {
            "reasoning" => serde_json::from_value(value).map(ResponseOutputItem::Reasoning),
            "function_call" => serde_json::from_value(value).map(ResponseOutputItem::FunctionCall),
            "message" => serde_json::from_value(value).map(ResponseOutputItem::Message),
            _ => return Ok(ResponseOutputItem::Other(value)),
        };
        item.map_err(serde::de::Error::custom)
    }
}

/// message 输出项中的内容片段
#[derive(Debug, Clone, PartialEq)]
pub enum OutputContent {
    OutputText { text: String },
    Refusal { refusal: String },
    Other(Value),
}

impl OutputContent {
    /// 可读文本：output_text / refusal，其它类型取 `text` 或 `reasoning` 字段
    pub fn text(&self) -> Option<&str> {
        match self {
            OutputContent::OutputText { text } => Some(text),
            OutputContent::Refusal { refusal } => Some(refusal),
            OutputContent::Other(v) => v
                .get("text")
                .and_then(Value::as_str)
                .or_else(|| v.get("reasoning").and_then(Value::as_str)),
        }
    }
}

impl Serialize for OutputContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            OutputContent::OutputText { text } => {
                serde_json::json!({"type": "output_text", "text": text}).serialize(serializer)
            }
            OutputContent::Refusal { refusal } => {
                serde_json::json!({"type": "refusal", "refusal": refusal}).serialize(serializer)
            }
            OutputContent::Other(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for OutputContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
        Ok(match (kind, field("text"), field("refusal")) {
            ("output_text", Some(text), _) => OutputContent::OutputText { text },
            ("refusal", _, Some(refusal)) => OutputContent::Refusal { refusal },
            _ => OutputContent::Other(value),
        })
    }
}

// ================== 流式事件 ==================

/// 上游 Responses 流式事件，按 `type` 字段区分
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseStreamEvent {
    #[serde(rename = "response.created")]
    Created { response: ResponsesResult },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        output_index: u32,
        item: ResponseOutputItem,
    },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        output_index: u32,
        item: ResponseOutputItem,
    },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },
    #[serde(rename = "response.output_text.done")]
    OutputTextDone {
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryTextDelta {
        output_index: u32,
        #[serde(default)]
        summary_index: u32,
        delta: String,
    },
    #[serde(rename = "response.reasoning_summary_text.done")]
    ReasoningSummaryTextDone {
        output_index: u32,
        #[serde(default)]
        summary_index: u32,
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta { output_index: u32, delta: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        output_index: u32,
        #[serde(default)]
        arguments: String,
    },
    #[serde(rename = "response.completed")]
    Completed { response: ResponsesResult },
    #[serde(rename = "response.incomplete")]
    Incomplete { response: ResponsesResult },
    #[serde(rename = "response.failed")]
    Failed { response: ResponsesResult },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_known_and_unknown_stream_events() {
        let added: ResponseStreamEvent = serde_json::from_value(json!({
            "type": "response.output_item.added",
            "output_index": 1,
            "item": {"type": "function_call", "call_id": "call_1", "name": "read", "arguments": ""}
        }))
        .unwrap();
        match added {
            ResponseStreamEvent::OutputItemAdded { output_index, item: ResponseOutputItem::FunctionCall(call) } => {
                assert_eq!(output_index, 1);
                assert_eq!(call.call_id.as_deref(), Some("call_1"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let unknown: ResponseStreamEvent =
            serde_json::from_value(json!({"type": "response.in_progress", "response": {}})).unwrap();
        assert_eq!(unknown, ResponseStreamEvent::Unknown);
    }

    #[test]
    fn output_content_falls_back_to_other() {
        let content: Vec<OutputContent> = serde_json::from_value(json!([
            {"type": "output_text", "text": "a", "annotations": []},
            {"type": "refusal", "refusal": "no"},
            {"type": "reasoning_text", "reasoning": "hmm"}
        ]))
        .unwrap();
        let texts: Vec<&str> = content.iter().filter_map(OutputContent::text).collect();
        assert_eq!(texts, vec!["a", "no", "hmm"]);
    }

    #[test]
    fn input_items_serialize_with_type_tags() {
        let item = ResponseInputItem::Reasoning {
            id: "rs_1".into(),
            summary: vec![SummaryText::new("think")],
            encrypted_content: "enc".into(),
        };
        assert_eq!(
            serde_json::to_value(&item).unwrap(),
            json!({"type": "reasoning", "id": "rs_1", "summary": [{"type": "summary_text", "text": "think"}], "encrypted_content": "enc"})
        );
    }
}
