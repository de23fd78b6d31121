//! 网关运行指标
//!
//! 计数器通过 `metrics` 门面记录，由 Prometheus 导出器在 /metrics 暴露。
//! 未安装导出器时（单元测试）记录调用是空操作。

use crate::error::{Error, Result};
use crate::models::{ClientProtocol, UpstreamEndpoint};
use crate::protocol::anthropic::AnthropicUsage;
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const UPSTREAM_ERRORS_TOTAL: &str = "gateway_upstream_errors_total";
pub const STREAM_ERRORS_TOTAL: &str = "gateway_stream_errors_total";
pub const TOKENS_TOTAL: &str = "gateway_tokens_total";

/// 安装全局 Prometheus recorder，返回用于渲染的句柄
pub fn install() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("Failed to install metrics recorder: {}", e)))
}

/// 每个入站请求按方言和最终路由的上游端点计数
pub fn record_request(dialect: ClientProtocol, route: UpstreamEndpoint) {
    counter!(
        REQUESTS_TOTAL,
        "dialect" => dialect.as_str(),
        "route" => route.as_str()
    )
    .increment(1);
}

pub fn record_upstream_error(status: u16) {
    counter!(UPSTREAM_ERRORS_TOTAL, "status" => status.to_string()).increment(1);
}

/// reason: malformed_event | transport | incomplete
pub fn record_stream_error(reason: &'static str) {
    counter!(STREAM_ERRORS_TOTAL, "reason" => reason).increment(1);
}

pub fn record_usage(usage: &AnthropicUsage) {
    counter!(TOKENS_TOTAL, "kind" => "input").increment(usage.input_tokens);
    counter!(TOKENS_TOTAL, "kind" => "output").increment(usage.output_tokens);
    if let Some(cached) = usage.cache_read_input_tokens {
        counter!(TOKENS_TOTAL, "kind" => "cache_read").increment(cached);
    }
}
