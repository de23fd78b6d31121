use crate::models::ClientProtocol;
use serde_json::Value;

pub struct ProtocolDetector;

impl ProtocolDetector {
    // 根据路径判断客户端协议，`/v1` 前缀可省略
    pub fn detect_from_path(path: &str) -> Option<ClientProtocol> {
        let path = path.strip_prefix("/v1").unwrap_or(path);

        if path.starts_with("/chat/completions") {
            return Some(ClientProtocol::ChatCompletions);
        }

        if path.starts_with("/messages") {
            return Some(ClientProtocol::Messages);
        }

        if path.starts_with("/responses") {
            return Some(ClientProtocol::Responses);
        }

        None
    }

    // 判断是否是流式请求，`stream` 不是布尔值时按非流式处理
    pub fn is_stream_value(json: &Value) -> bool {
        json.get("stream").and_then(|v| v.as_bool()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_with_and_without_version_prefix() {
        assert_eq!(
            ProtocolDetector::detect_from_path("/v1/chat/completions"),
            Some(ClientProtocol::ChatCompletions)
        );
        assert_eq!(
            ProtocolDetector::detect_from_path("/responses"),
            Some(ClientProtocol::Responses)
        );
        assert_eq!(
            ProtocolDetector::detect_from_path("/v1/messages"),
            Some(ClientProtocol::Messages)
        );
        assert_eq!(ProtocolDetector::detect_from_path("/v1/models"), None);
    }

    #[test]
    fn stream_flag_defaults_to_false() {
        use serde_json::json;
        assert!(ProtocolDetector::is_stream_value(&json!({"stream": true})));
        assert!(!ProtocolDetector::is_stream_value(&json!({"stream": "yes"})));
        assert!(!ProtocolDetector::is_stream_value(&json!({"model": "gpt-4o"})));
    }
}
