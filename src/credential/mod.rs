//! 上游凭证
//!
//! 请求路径只从 `TokenStore` 读取当前 token；刷新由后台任务完成。

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// 在过期前多久刷新
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// 刷新间隔下限，也用作失败后的重试间隔
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// 当前上游 token 的快照
#[derive(Debug, Default)]
pub struct TokenStore {
    token: RwLock<Option<String>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// 没有可用 token 时立即失败，不等待刷新
    pub fn current(&self) -> Result<String> {
        let guard = self.token.read().unwrap_or_else(|e| e.into_inner());
        guard.clone().ok_or(Error::CredentialMissing)
    }

    pub fn set(&self, token: String) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(token);
    }
}

/// 一次签发的 token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    /// 为空表示不会过期
    pub refresh_in: Option<Duration>,
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<IssuedToken>;
}

/// 配置文件中的静态 token
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self) -> Result<IssuedToken> {
        Ok(IssuedToken {
            token: self.token.clone(),
            refresh_in: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    token: String,
    /// 秒
    refresh_in: u64,
}

/// 用长期凭证向交换端点换取短期 token
pub struct ExchangeTokenSource {
    client: Client,
    url: String,
    credential: String,
}

impl ExchangeTokenSource {
    pub fn new(url: impl Into<String>, credential: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(Error::Http)?;
        Ok(Self {
            client,
            url: url.into(),
            credential: credential.into(),
        })
    }
}

#[async_trait]
impl TokenSource for ExchangeTokenSource {
    async fn fetch(&self) -> Result<IssuedToken> {
        let response = self
            .client
            .get(&self.url)
            .header("authorization", format!("token {}", self.credential))
            .header("accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let exchanged: ExchangeResponse = response.json().await?;
        Ok(IssuedToken {
            token: exchanged.token,
            refresh_in: Some(Duration::from_secs(exchanged.refresh_in)),
        })
    }
}

/// 根据配置选择 token 来源：交换端点优先，其次静态 token
pub fn source_from_config(config: &UpstreamConfig, timeout: Duration) -> Result<Option<Arc<dyn TokenSource>>> {
    if let (Some(url), Some(credential)) = (&config.token_exchange_url, &config.exchange_credential) {
        return Ok(Some(Arc::new(ExchangeTokenSource::new(url, credential, timeout)?)));
    }
    Ok(config
        .token
        .as_ref()
        .map(|token| Arc::new(StaticTokenSource::new(token)) as Arc<dyn TokenSource>))
}

pub fn refresh_delay(refresh_in: Duration) -> Duration {
    refresh_in.saturating_sub(REFRESH_MARGIN).max(MIN_REFRESH_INTERVAL)
}

/// 首次获取 token 并写入存储，返回下次刷新前的等待时间
pub async fn initialize(source: &dyn TokenSource, store: &TokenStore) -> Result<Option<Duration>> {
    let issued = source.fetch().await?;
    store.set(issued.token);
    debug!("Upstream token fetched");
    Ok(issued.refresh_in.map(refresh_delay))
}

/// 后台刷新任务；刷新失败时保留旧 token 并稍后重试
pub fn spawn_refresh(source: Arc<dyn TokenSource>, store: Arc<TokenStore>, first_delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = first_delay;
        loop {
            tokio::time::sleep(delay).await;
            debug!("Refreshing upstream token");
            match source.fetch().await {
                Ok(issued) => {
                    store.set(issued.token);
                    info!("Upstream token refreshed");
                    match issued.refresh_in {
                        Some(refresh_in) => delay = refresh_delay(refresh_in),
                        None => break,
                    }
                }
                Err(e) => {
                    error!("Failed to refresh upstream token: {}", e);
                    delay = MIN_REFRESH_INTERVAL;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn empty_store_fails_fast() {
        let store = TokenStore::new();
        assert!(matches!(store.current(), Err(Error::CredentialMissing)));
        store.set("abc".into());
        assert_eq!(store.current().unwrap(), "abc");
    }

    #[test]
    fn refreshes_a_minute_before_expiry_with_floor() {
        assert_eq!(refresh_delay(Duration::from_secs(1500)), Duration::from_secs(1440));
        assert_eq!(refresh_delay(Duration::from_secs(10)), MIN_REFRESH_INTERVAL);
    }

    #[tokio::test]
    async fn exchanges_credential_for_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/copilot_internal/v2/token"))
            .and(header("authorization", "token gho_long_lived"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token": "tid=short",
                "refresh_in": 1500,
                "expires_at": 1700000000
            })))
            .mount(&server)
            .await;

        let source = ExchangeTokenSource::new(
            format!("{}/copilot_internal/v2/token", server.uri()),
            "gho_long_lived",
            Duration::from_secs(5),
        )
        .unwrap();
        let store = TokenStore::new();
        let next = initialize(&source, &store).await.unwrap();

        assert_eq!(store.current().unwrap(), "tid=short");
        assert_eq!(next, Some(Duration::from_secs(1440)));
    }

    #[tokio::test]
    async fn exchange_failure_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credential"))
            .mount(&server)
            .await;

        let source = ExchangeTokenSource::new(server.uri(), "x", Duration::from_secs(5)).unwrap();
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, Error::Upstream { status: 401, .. }));
    }

    #[tokio::test]
    async fn static_token_never_refreshes() {
        let store = TokenStore::new();
        let next = initialize(&StaticTokenSource::new("static"), &store).await.unwrap();
        assert_eq!(next, None);
        assert_eq!(store.current().unwrap(), "static");
    }
}
