//! Anthropic Messages 协议类型
//!
//! 内容块是封闭的枚举；未知的块类型保留原始 JSON（`ContentBlock::Unknown`），
//! 原生转发时原样写回，转换到其它协议时按“尽力而为”处理。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessagesPayload {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<AnthropicToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_config: Option<OutputConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnthropicMessagesPayload {
    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl SystemPrompt {
    /// 系统提示中的所有文本片段
    pub fn texts(&self) -> Vec<&str> {
        match self {
            SystemPrompt::Text(text) => vec![text.as_str()],
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text(t) => Some(t.text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

// 以下块结构都带 `extra`：未建模的字段（citations 等）原生转发时原样写回

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cache_control: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    pub source: ImageSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 图片来源：base64 内联数据或 URL；其它来源（file 等）保留原始 JSON
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
    Other(Value),
}

impl ImageSource {
    /// OpenAI 方言使用的图片地址；base64 转成 data URL
    pub fn url(&self) -> Option<String> {
        match self {
            ImageSource::Base64 { media_type, data } => Some(format!("data:{};base64,{}", media_type, data)),
            ImageSource::Url { url } => Some(url.clone()),
            ImageSource::Other(_) => None,
        }
    }
}

impl Serialize for ImageSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let value = match self {
            ImageSource::Base64 { media_type, data } => {
                serde_json::json!({"type": "base64", "media_type": media_type, "data": data})
            }
            ImageSource::Url { url } => serde_json::json!({"type": "url", "url": url}),
            ImageSource::Other(value) => return value.serialize(serializer),
        };
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ImageSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = str_field(&value, "type");
        let source = match kind.as_deref() {
            Some("base64") => match (str_field(&value, "media_type"), str_field(&value, "data")) {
                (Some(media_type), Some(data)) => ImageSource::Base64 { media_type, data },
                _ => ImageSource::Other(value),
            },
            Some("url") => match str_field(&value, "url") {
                Some(url) => ImageSource::Url { url },
                None => ImageSource::Other(value),
            },
            _ => ImageSource::Other(value),
        };
        Ok(source)
    }
}

fn str_field(value: &Value, name: &str) -> Option<String> {
    value.get(name).and_then(Value::as_str).map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    #[serde(default = "ToolResultContent::empty")]
    pub content: ToolResultContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    fn empty() -> Self {
        ToolResultContent::Text(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    pub thinking: String,
    #[serde(default)]
    pub signature: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ThinkingBlock {
    pub fn new(thinking: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            thinking: thinking.into(),
            signature: signature.into(),
            extra: Map::new(),
        }
    }
}

/// Anthropic 内容块
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(TextBlock),
    Image(ImageBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
    Thinking(ThinkingBlock),
    /// 未知块类型，保留原始 JSON
    Unknown(Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextBlock::new(text))
    }

    pub fn type_name(&self) -> &str {
        match self {
            ContentBlock::Text(_) => "text",
            ContentBlock::Image(_) => "image",
            ContentBlock::ToolUse(_) => "tool_use",
            ContentBlock::ToolResult(_) => "tool_result",
            ContentBlock::Thinking(_) => "thinking",
            ContentBlock::Unknown(v) => v.get("type").and_then(Value::as_str).unwrap_or("unknown"),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedBlockRef<'a> {
    Text(&'a TextBlock),
    Image(&'a ImageBlock),
    ToolUse(&'a ToolUseBlock),
    ToolResult(&'a ToolResultBlock),
    Thinking(&'a ThinkingBlock),
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ContentBlock::Text(b) => TaggedBlockRef::Text(b).serialize(serializer),
            ContentBlock::Image(b) => TaggedBlockRef::Image(b).serialize(serializer),
            ContentBlock::ToolUse(b) => TaggedBlockRef::ToolUse(b).serialize(serializer),
            ContentBlock::ToolResult(b) => TaggedBlockRef::ToolResult(b).serialize(serializer),
            ContentBlock::Thinking(b) => TaggedBlockRef::Thinking(b).serialize(serializer),
            ContentBlock::Unknown(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut value = Value::deserialize(deserializer)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
        if !matches!(kind.as_str(), "text" | "image" | "tool_use" | "tool_result" | "thinking") {
            return Ok(ContentBlock::Unknown(value));
        }
        // 类型标签由 TaggedBlockRef 写回，不能落进 extra
        if let Some(object) = value.as_object_mut() {
            object.remove("type");
        }
        let block = match kind.as_str() {
            "text" => serde_json::from_value(value).map(ContentBlock::Text),
            "image" => serde_json::from_value(value).map(ContentBlock::Image),
            "tool_use" => serde_json::from_value(value).map(ContentBlock::ToolUse),
            "tool_result" => serde_json::from_value(value).map(ContentBlock::ToolResult),
            "thinking" => serde_json::from_value(value).map(ContentBlock::Thinking),
            _ => return Ok(ContentBlock::Unknown(value)),
        };
        block.map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicToolChoice {
    /// auto | any | tool | none
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingConfig {
    /// enabled | adaptive | disabled
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ================== 响应 ==================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    PauseTurn,
    Refusal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnthropicUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: AnthropicUsage,
}

impl AnthropicResponse {
    pub fn new(id: String, model: String, content: Vec<ContentBlock>) -> Self {
        Self {
            id,
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model,
            stop_reason: None,
            stop_sequence: None,
            usage: AnthropicUsage::default(),
        }
    }
}

// ================== 流式事件 ==================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicResponse,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlockStart,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorBody,
    },
}

impl AnthropicStreamEvent {
    /// SSE `event:` 字段
    pub fn event_name(&self) -> &'static str {
        match self {
            AnthropicStreamEvent::MessageStart { .. } => "message_start",
            AnthropicStreamEvent::ContentBlockStart { .. } => "content_block_start",
            AnthropicStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            AnthropicStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            AnthropicStreamEvent::MessageDelta { .. } => "message_delta",
            AnthropicStreamEvent::MessageStop => "message_stop",
            AnthropicStreamEvent::Ping => "ping",
            AnthropicStreamEvent::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        AnthropicStreamEvent::Error {
            error: ErrorBody {
                error_type: "api_error".to_string(),
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockStart {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    Thinking { thinking: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_blocks_survive_reserialization() {
        let raw = json!({"type": "document", "source": {"type": "text", "data": "hi"}});
        let block: ContentBlock = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(block, ContentBlock::Unknown(_)));
        assert_eq!(block.type_name(), "document");
        assert_eq!(serde_json::to_value(&block).unwrap(), raw);
    }

    #[test]
    fn known_blocks_keep_type_tag() {
        let raw = json!({"type": "tool_use", "id": "toolu_1", "name": "read", "input": {"path": "a"}});
        let block: ContentBlock = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(block, ContentBlock::ToolUse(_)));
        assert_eq!(serde_json::to_value(&block).unwrap(), raw);
    }

    #[test]
    fn payload_keeps_unmodelled_fields() {
        let raw = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}],
            "context_management": {"edits": []}
        });
        let payload: AnthropicMessagesPayload = serde_json::from_value(raw).unwrap();
        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back["context_management"], json!({"edits": []}));
    }

    #[test]
    fn image_sources_accept_base64_and_url() {
        let url: ContentBlock = serde_json::from_value(json!({
            "type": "image", "source": {"type": "url", "url": "https://x/y.png"}
        }))
        .unwrap();
        let ContentBlock::Image(image) = &url else {
            panic!("expected image block, got {:?}", url);
        };
        assert_eq!(image.source, ImageSource::Url { url: "https://x/y.png".into() });
        assert_eq!(image.source.url().as_deref(), Some("https://x/y.png"));

        let raw = json!({"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAA"}});
        let inline: ContentBlock = serde_json::from_value(raw.clone()).unwrap();
        let ContentBlock::Image(image) = &inline else {
            panic!("expected image block, got {:?}", inline);
        };
        assert_eq!(image.source.url().as_deref(), Some("data:image/png;base64,AAA"));
        assert_eq!(serde_json::to_value(&inline).unwrap(), raw);
    }

    #[test]
    fn unrecognised_image_source_is_kept_verbatim() {
        let raw = json!({"type": "image", "source": {"type": "file", "file_id": "file_1"}});
        let block: ContentBlock = serde_json::from_value(raw.clone()).unwrap();
        let ContentBlock::Image(image) = &block else {
            panic!("expected image block, got {:?}", block);
        };
        assert!(image.source.url().is_none());
        assert_eq!(serde_json::to_value(&block).unwrap(), raw);
    }

    #[test]
    fn block_fields_without_a_model_are_preserved() {
        let raw = json!({
            "type": "text",
            "text": "hi",
            "citations": [{"type": "char_location", "cited_text": "hi", "document_index": 0}]
        });
        let block: ContentBlock = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(block, ContentBlock::Text(_)));
        assert_eq!(serde_json::to_value(&block).unwrap(), raw);

        let thinking: ThinkingConfig =
            serde_json::from_value(json!({"type": "enabled", "budget_tokens": 2048, "display": "summarized"})).unwrap();
        assert_eq!(thinking.extra["display"], "summarized");
        assert_eq!(
            serde_json::to_value(&thinking).unwrap(),
            json!({"type": "enabled", "budget_tokens": 2048, "display": "summarized"})
        );
    }

    #[test]
    fn stream_events_serialize_with_wire_names() {
        let stop = serde_json::to_value(AnthropicStreamEvent::MessageStop).unwrap();
        assert_eq!(stop, json!({"type": "message_stop"}));

        let delta = AnthropicStreamEvent::ContentBlockDelta {
            index: 2,
            delta: BlockDelta::InputJsonDelta {
                partial_json: "{\"a\"".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&delta).unwrap(),
            json!({"type": "content_block_delta", "index": 2, "delta": {"type": "input_json_delta", "partial_json": "{\"a\""}})
        );

        let err = serde_json::to_value(AnthropicStreamEvent::error("boom")).unwrap();
        assert_eq!(err, json!({"type": "error", "error": {"type": "api_error", "message": "boom"}}));
    }
}
