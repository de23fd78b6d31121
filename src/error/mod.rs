use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// 入站请求体无法按声明的协议解析
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 上游返回非 2xx，保留状态码和原始响应体
    #[error("Upstream returned error status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Upstream credential is not available")]
    CredentialMissing,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limit exceeded. Try again in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("{0}")]
    UnsupportedModelEndpoint(String),

    /// 流式校验失败（空白字符失控、事件格式错误），只会以流内 error 事件的形式出现
    #[error("Stream validation failed: {0}")]
    StreamValidation(String),

    /// 上游流在终止事件之前断开，由流内 error 事件兜底
    #[error("{0} stream ended without completion")]
    IncompleteStream(&'static str),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// 映射到返回给客户端的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Protocol(_) | Error::UnsupportedModelEndpoint(_) => 400,
            Error::Unauthorized(_) | Error::CredentialMissing => 401,
            Error::RateLimited { .. } => 429,
            Error::Upstream { status, .. } => *status,
            Error::Http(_) => 502,
            _ => 500,
        }
    }

    /// OpenAI / Anthropic 错误体中的 `type` 字段
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Protocol(_) | Error::UnsupportedModelEndpoint(_) => "invalid_request_error",
            Error::Unauthorized(_) | Error::CredentialMissing => "authentication_error",
            Error::RateLimited { .. } => "rate_limit_error",
            Error::Upstream { status, .. } if *status < 500 => "invalid_request_error",
            _ => "api_error",
        }
    }

    /// 4xx 错误属于客户端问题，不应重试
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_endpoint_is_invalid_request() {
        let err = Error::UnsupportedModelEndpoint("nope".into());
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.error_type(), "invalid_request_error");
        assert!(err.is_client_error());
    }

    #[test]
    fn upstream_status_is_forwarded() {
        let err = Error::Upstream {
            status: 503,
            body: "{}".into(),
        };
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.error_type(), "api_error");
        assert!(!err.is_client_error());
    }

    #[test]
    fn credential_missing_is_fatal_401() {
        assert_eq!(Error::CredentialMissing.status_code(), 401);
    }
}
