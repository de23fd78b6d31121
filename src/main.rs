use ai_dialect_gateway::{
    cache::Cache,
    config::{Config, LogFormat},
    credential::{self, TokenStore},
    proxy::ProxyForwarder,
    rate_limit::RateLimiter,
    router::Router,
    server::{build_router, AppState},
    telemetry,
};
use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::from_file(&config_path);
    let config_error = config.as_ref().err().map(|e| e.to_string());
    let config = config.unwrap_or_else(|_| Config::default());

    // 初始化日志，支持通过环境变量配置，默认info级别
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    info!("Starting AI dialect gateway...");
    if let Some(e) = config_error {
        info!("Failed to load {} ({}), using default config", config_path, e);
    }

    // 凭证
    let tokens = Arc::new(TokenStore::new());
    match credential::source_from_config(&config.upstream, config.proxy.timeout)? {
        Some(source) => {
            let next_refresh = credential::initialize(source.as_ref(), &tokens)
                .await
                .context("failed to obtain upstream token")?;
            if let Some(delay) = next_refresh {
                credential::spawn_refresh(source, tokens.clone(), delay);
            }
        }
        None => warn!("No upstream credential configured; upstream requests will fail with 401"),
    }

    // 模型目录
    let cache = Arc::new(Cache::new());
    if let Some(seed) = &config.catalog.seed_file {
        match cache.load_yaml_seed(seed) {
            Ok(count) => info!("Loaded {} models from {}", count, seed.display()),
            Err(e) => warn!("Failed to load model seed file {}: {}", seed.display(), e),
        }
    }

    let proxy = Arc::new(ProxyForwarder::new(config.proxy.clone(), &config.upstream, tokens.clone())?);
    let router = Arc::new(Router::new(cache.clone(), proxy.clone(), config.catalog.clone()));
    if tokens.current().is_ok() {
        if let Err(e) = router.refresh_catalog().await {
            warn!("Initial model catalog fetch failed: {}", e);
        }
    }
    router.clone().spawn_refresh();

    let metrics = match telemetry::install() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("{}", e);
            None
        }
    };

    let state = AppState {
        router,
        proxy,
        rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
        api_keys: Arc::new(config.auth.api_keys.clone()),
        small_fast_model: config.routing.small_fast_model.clone(),
        metrics,
    };
    let app = build_router(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
