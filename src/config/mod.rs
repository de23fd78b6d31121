use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use crate::error::Result;

/// 网关的主配置结构
/// 包含服务器、上游、模型目录、代理、鉴权、限流等各个模块的配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// 服务器相关配置
    pub server: ServerConfig,
    /// 上游API配置（地址、凭证、附加header）
    pub upstream: UpstreamConfig,
    /// 模型目录缓存配置
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// 代理转发配置
    pub proxy: ProxyConfig,
    /// 入站API Key鉴权
    #[serde(default)]
    pub auth: AuthConfig,
    /// 请求限流
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 轻量请求（compact / warmup）的模型替换
    #[serde(default)]
    pub routing: RoutingConfig,
    /// 日志输出配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 服务器配置
/// 定义HTTP服务器的监听地址和端口
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// 服务器监听地址，例如 "0.0.0.0" 或 "127.0.0.1"
    pub host: String,
    /// 服务器监听端口，默认为4141
    pub port: u16,
}

/// 上游配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// 上游API的基础URL，例如 "https://api.githubcopilot.com"
    pub base_url: String,
    /// 静态上游token；与 token_exchange_url 二选一
    #[serde(default)]
    pub token: Option<String>,
    /// token交换端点，返回 {"token": "...", "refresh_in": 1500}
    #[serde(default)]
    pub token_exchange_url: Option<String>,
    /// 调用交换端点时使用的长期凭证
    #[serde(default)]
    pub exchange_credential: Option<String>,
    /// 每个上游请求都会附带的header（editor-version 等）
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

/// 模型目录配置
/// 目录是只读快照，由后台任务按固定周期刷新；刷新失败时保留上一份
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// 目录刷新周期，使用humantime格式
    #[serde(with = "humantime_serde", default = "default_catalog_refresh")]
    pub refresh_interval: Duration,
    /// 可选的本地YAML种子文件，上游 /models 不可用时兜底
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
    /// 拉取 /models 失败时的重试次数
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_catalog_refresh() -> Duration {
    Duration::from_secs(600)
}

fn default_retry_attempts() -> u32 {
    3
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_catalog_refresh(),
            seed_file: None,
            retry_attempts: default_retry_attempts(),
        }
    }
}

/// 代理配置
/// 用于配置HTTP代理转发的相关参数
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// 非流式请求超时时间，针对上游LLM服务的请求
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// 每个host的最大空闲连接数
    pub max_connections: usize,
    /// 是否启用HTTP Keep-Alive
    pub keep_alive: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// 为空时不做鉴权（开放模式）
    #[serde(default)]
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// 两次请求之间的最小间隔；为空表示不限流
    #[serde(with = "humantime_serde", default)]
    pub interval: Option<Duration>,
    /// 超限时等待而不是直接返回429
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// compact / warmup 请求替换成的轻量模型
    #[serde(default)]
    pub small_fast_model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Config {
    /// 从配置文件加载配置
    ///
    /// # 参数
    /// * `path` - 配置文件路径（支持YAML、TOML、JSON等格式）
    ///
    /// # 说明
    /// 1. 首先从指定文件加载配置
    /// 2. 然后从环境变量覆盖配置（前缀为GATEWAY，分隔符为__）
    ///    例如：GATEWAY__SERVER__PORT=8081 会覆盖 server.port
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
            .build()
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::error::Error::Config(e.to_string()))
    }

    /// 创建默认配置
    ///
    /// # 默认值
    /// - 服务器：监听 0.0.0.0:4141
    /// - 上游：https://api.githubcopilot.com，无凭证
    /// - 目录：10分钟刷新，1小时TTL
    /// - 代理：超时300秒，每host 100空闲连接，启用Keep-Alive
    pub fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 4141,
            },
            upstream: UpstreamConfig {
                base_url: "https://api.githubcopilot.com".to_string(),
                token: None,
                token_exchange_url: None,
                exchange_credential: None,
                extra_headers: HashMap::new(),
            },
            catalog: CatalogConfig::default(),
            proxy: ProxyConfig {
                timeout: Duration::from_secs(300),
                max_connections: 100,
                keep_alive: true,
            },
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            routing: RoutingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
