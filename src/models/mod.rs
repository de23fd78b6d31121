use serde::{Deserialize, Serialize};

/// 客户端协议类型
/// 定义入站请求使用的协议格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientProtocol {
    /// OpenAI Chat Completions (/v1/chat/completions)
    ChatCompletions,
    /// OpenAI Responses (/v1/responses)
    Responses,
    /// Anthropic Messages (/v1/messages)
    Messages,
}

impl ClientProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientProtocol::ChatCompletions => "chat_completions",
            ClientProtocol::Responses => "responses",
            ClientProtocol::Messages => "messages",
        }
    }
}

/// 上游端点类型
/// 转发到上游时实际使用的协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamEndpoint {
    ChatCompletions,
    Responses,
    Messages,
}

impl UpstreamEndpoint {
    /// 模型目录 `supported_endpoints` 中使用的路径
    pub fn catalog_path(&self) -> &'static str {
        match self {
            UpstreamEndpoint::ChatCompletions => "/chat/completions",
            UpstreamEndpoint::Responses => "/responses",
            UpstreamEndpoint::Messages => "/v1/messages",
        }
    }

    /// 拼接到 base_url 后面的请求路径
    pub fn request_path(&self) -> &'static str {
        match self {
            UpstreamEndpoint::ChatCompletions => "/chat/completions",
            UpstreamEndpoint::Responses => "/responses",
            UpstreamEndpoint::Messages => "/v1/messages",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamEndpoint::ChatCompletions => "chat_completions",
            UpstreamEndpoint::Responses => "responses",
            UpstreamEndpoint::Messages => "messages",
        }
    }
}

/// 计费相关的发起方标记（X-Initiator）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initiator {
    User,
    Agent,
}

impl Initiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Initiator::User => "user",
            Initiator::Agent => "agent",
        }
    }
}

/// 上游请求的附加选项
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// 请求中包含图片
    pub vision: bool,
    /// 为空时由传输层按默认规则推断为 user
    pub initiator: Option<Initiator>,
    /// 原样透传的 anthropic-beta header
    pub anthropic_beta: Option<String>,
}

/// 模型目录中的一个模型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub supported_endpoints: Option<Vec<String>>,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
}

impl ModelInfo {
    pub fn supports(&self, endpoint: UpstreamEndpoint) -> bool {
        self.supported_endpoints
            .as_ref()
            .map(|eps| eps.iter().any(|e| e == endpoint.catalog_path()))
            .unwrap_or(false)
    }

    pub fn max_output_tokens(&self) -> Option<u32> {
        self.capabilities.limits.max_output_tokens
    }

    pub fn supports_adaptive_thinking(&self) -> bool {
        self.capabilities.supports.adaptive_thinking.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub limits: ModelLimits,
    #[serde(default)]
    pub supports: ModelSupports,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelLimits {
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub max_prompt_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSupports {
    #[serde(default)]
    pub adaptive_thinking: Option<bool>,
    #[serde(default)]
    pub tool_calls: Option<bool>,
    #[serde(default)]
    pub vision: Option<bool>,
}

/// 上游 /models 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_checks_catalog_paths() {
        let model: ModelInfo = serde_json::from_value(serde_json::json!({
            "id": "claude-sonnet-4",
            "supported_endpoints": ["/v1/messages", "/chat/completions"],
            "capabilities": {"supports": {"adaptive_thinking": true}, "limits": {"max_output_tokens": 16000}}
        }))
        .unwrap();

        assert!(model.supports(UpstreamEndpoint::Messages));
        assert!(model.supports(UpstreamEndpoint::ChatCompletions));
        assert!(!model.supports(UpstreamEndpoint::Responses));
        assert!(model.supports_adaptive_thinking());
        assert_eq!(model.max_output_tokens(), Some(16000));
    }

    #[test]
    fn missing_endpoint_list_supports_nothing() {
        let model: ModelInfo = serde_json::from_value(serde_json::json!({"id": "gpt-4o"})).unwrap();
        assert!(!model.supports(UpstreamEndpoint::ChatCompletions));
        assert!(!model.supports_adaptive_thinking());
    }
}
