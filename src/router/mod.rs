use crate::cache::Cache;
use crate::config::CatalogConfig;
use crate::error::{Error, Result};
use crate::models::{ClientProtocol, ModelInfo, ModelsResponse, UpstreamEndpoint};
use crate::proxy::ProxyForwarder;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const RESPONSES_UNSUPPORTED_MESSAGE: &str =
    "This model does not support the responses endpoint. Please choose a different model.";

/// 选择上游端点：原生 Messages > Responses > Chat Completions
///
/// 目录未命中时走 Chat Completions。
pub fn select_endpoint(inbound: ClientProtocol, model: Option<&ModelInfo>) -> UpstreamEndpoint {
    let Some(model) = model else {
        return UpstreamEndpoint::ChatCompletions;
    };

    if inbound == ClientProtocol::Messages && model.supports(UpstreamEndpoint::Messages) {
        UpstreamEndpoint::Messages
    } else if model.supports(UpstreamEndpoint::Responses) {
        UpstreamEndpoint::Responses
    } else {
        UpstreamEndpoint::ChatCompletions
    }
}

/// Responses 入站请求要求模型支持 /responses
pub fn ensure_responses_supported(model: Option<&ModelInfo>) -> Result<()> {
    match model {
        Some(model) if model.supports(UpstreamEndpoint::Responses) => Ok(()),
        _ => Err(Error::UnsupportedModelEndpoint(RESPONSES_UNSUPPORTED_MESSAGE.to_string())),
    }
}

/// 模型目录的维护者：从上游 /models 拉取并整体替换缓存快照
pub struct Router {
    cache: Arc<Cache>,
    proxy: Arc<ProxyForwarder>,
    catalog_config: CatalogConfig,
}

impl Router {
    pub fn new(cache: Arc<Cache>, proxy: Arc<ProxyForwarder>, catalog_config: CatalogConfig) -> Self {
        Self {
            cache,
            proxy,
            catalog_config,
        }
    }

    pub fn lookup(&self, model_id: &str) -> Option<Arc<ModelInfo>> {
        self.cache.get(model_id)
    }

    pub fn list(&self) -> Vec<Arc<ModelInfo>> {
        self.cache.list()
    }

    pub fn resolve(&self, inbound: ClientProtocol, model_id: &str) -> (UpstreamEndpoint, Option<Arc<ModelInfo>>) {
        let model = self.lookup(model_id);
        let endpoint = select_endpoint(inbound, model.as_deref());
        info!(
            "Routing {} request for model {} -> {}",
            inbound.as_str(),
            model_id,
            endpoint.as_str()
        );
        (endpoint, model)
    }

    /// 拉取 /models 并替换目录，5xx 和连接错误按退避重试
    pub async fn refresh_catalog(&self) -> Result<usize> {
        let mut retry_count = 0;
        let max_retries = self.catalog_config.retry_attempts;

        loop {
            match self.proxy.get("/models").await {
                Ok(body) => {
                    let models: ModelsResponse = serde_json::from_slice(&body)?;
                    let count = models.data.len();
                    self.cache.replace_all(models.data);
                    info!("Model catalog refreshed: {} models", count);
                    return Ok(count);
                }
                Err(e) if is_retryable(&e) && retry_count < max_retries => {
                    retry_count += 1;
                    error!(
                        "Error fetching model catalog: {}. Retrying {}/{}",
                        e, retry_count, max_retries
                    );
                    tokio::time::sleep(Duration::from_millis(100 * retry_count as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 按配置周期刷新目录；失败时保留旧快照
    pub fn spawn_refresh(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.catalog_config.refresh_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.refresh_catalog().await {
                    warn!("Model catalog refresh failed, keeping previous snapshot: {}", e);
                }
            }
        })
    }
}

fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Upstream { status, .. } => *status >= 500,
        Error::Http(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, UpstreamConfig};
    use crate::credential::TokenStore;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model(endpoints: &[&str]) -> ModelInfo {
        serde_json::from_value(json!({"id": "m", "supported_endpoints": endpoints})).unwrap()
    }

    #[test]
    fn prefers_native_then_responses_then_chat() {
        let native = model(&["/v1/messages", "/responses", "/chat/completions"]);
        let responses = model(&["/responses", "/chat/completions"]);
        let chat = model(&["/chat/completions"]);

        assert_eq!(select_endpoint(ClientProtocol::Messages, Some(&native)), UpstreamEndpoint::Messages);
        assert_eq!(select_endpoint(ClientProtocol::Messages, Some(&responses)), UpstreamEndpoint::Responses);
        assert_eq!(select_endpoint(ClientProtocol::Messages, Some(&chat)), UpstreamEndpoint::ChatCompletions);
        assert_eq!(select_endpoint(ClientProtocol::Messages, None), UpstreamEndpoint::ChatCompletions);
    }

    #[test]
    fn responses_inbound_requires_support() {
        assert!(ensure_responses_supported(Some(&model(&["/responses"]))).is_ok());
        let err = ensure_responses_supported(Some(&model(&["/chat/completions"]))).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_string(), RESPONSES_UNSUPPORTED_MESSAGE);
        assert!(ensure_responses_supported(None).is_err());
    }

    fn router(base_url: String) -> (Router, Arc<Cache>) {
        let cache = Arc::new(Cache::new());
        let upstream = UpstreamConfig {
            base_url,
            token: None,
            token_exchange_url: None,
            exchange_credential: None,
            extra_headers: HashMap::new(),
        };
        let proxy = ProxyForwarder::new(
            ProxyConfig {
                timeout: Duration::from_secs(5),
                max_connections: 2,
                keep_alive: false,
            },
            &upstream,
            Arc::new(TokenStore::with_token("tok")),
        )
        .unwrap();
        let router = Router::new(cache.clone(), Arc::new(proxy), CatalogConfig::default());
        (router, cache)
    }

    #[tokio::test]
    async fn refresh_replaces_catalog_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "gpt-5", "supported_endpoints": ["/responses"]},
                    {"id": "claude-sonnet-4", "supported_endpoints": ["/v1/messages"]}
                ]
            })))
            .mount(&server)
            .await;

        let (router, cache) = router(server.uri());
        assert_eq!(router.refresh_catalog().await.unwrap(), 2);
        assert_eq!(cache.list().len(), 2);

        let (endpoint, _) = router.resolve(ClientProtocol::Messages, "gpt-5");
        assert_eq!(endpoint, UpstreamEndpoint::Responses);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "gpt-5", "supported_endpoints": ["/responses"]}]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (router, cache) = router(server.uri());
        router.refresh_catalog().await.unwrap();
        assert!(router.refresh_catalog().await.is_err());

        assert!(cache.get("gpt-5").is_some());
        let (endpoint, model) = router.resolve(ClientProtocol::Messages, "gpt-5");
        assert_eq!(endpoint, UpstreamEndpoint::Responses);
        assert!(ensure_responses_supported(model.as_deref()).is_ok());
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let (router, _) = router(server.uri());
        assert!(router.refresh_catalog().await.is_err());
    }
}
