mod app;

use app::{app_router, AppState};
use berth_core::{ContainerManager, ManagerConfig};
use dotenvy::dotenv;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

#[derive(Debug, Clone)]
struct ApiConfig {
    bind: SocketAddr,
    manager: ManagerConfig,
    /// CORS 允许的来源列表（空则允许所有）
    cors_origins: Vec<String>,
}

impl ApiConfig {
    fn from_env() -> Self {
        let bind: SocketAddr = env::var("BERTH_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:8080".parse().expect("valid default bind"));

        let defaults = ManagerConfig::default();

        // 对外可达的流式端点地址；未配置时按监听端口推断
        let stream_base_url = env::var("BERTH_STREAM_URL")
            .ok()
            .and_then(|s| Url::parse(s.trim()).ok())
            .or_else(|| Url::parse(&format!("http://127.0.0.1:{}/stream/", bind.port())).ok())
            .unwrap_or(defaults.stream_base_url);

        let stream_token_ttl = env::var("BERTH_STREAM_TOKEN_TTL_SECS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.stream_token_ttl);

        let task_resolve_attempts = env::var("BERTH_TASK_RESOLVE_ATTEMPTS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.task_resolve_attempts);

        let task_resolve_interval = env::var("BERTH_TASK_RESOLVE_INTERVAL_MS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.task_resolve_interval);

        // CORS 允许的来源，逗号分隔；空或 "*" 表示允许所有
        let cors_origins = env::var("BERTH_CORS_ORIGINS")
            .ok()
            .map(|s| {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed == "*" {
                    vec![]
                } else {
                    trimmed
                        .split(',')
                        .filter(|t| !t.trim().is_empty())
                        .map(|t| t.trim().to_string())
                        .collect()
                }
            })
            .unwrap_or_default();

        Self {
            bind,
            manager: ManagerConfig {
                stream_base_url,
                stream_token_ttl,
                task_resolve_attempts,
                task_resolve_interval,
            },
            cors_origins,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 优先读取 .env（若存在）
    let _ = dotenv();
    init_tracing();

    let config = ApiConfig::from_env();
    info!(
        "starting API on {} (stream endpoint {})",
        config.bind, config.manager.stream_base_url
    );

    let state = AppState {
        manager: Arc::new(ContainerManager::new(config.manager.clone())),
    };

    let app = app_router(state, config.cors_origins.clone());
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
