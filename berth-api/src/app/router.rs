use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};

use super::handlers::{
    create_container, delete_container, get_container, handler_404, health, list_containers,
    prepare_attach, start_container, stream_attach,
};
use super::state::AppState;

/// 根据配置的来源列表构建 CorsLayer
fn build_cors_layer(cors_origins: Vec<String>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true);

    if cors_origins.is_empty() {
        tracing::warn!(
            "BERTH_CORS_ORIGINS not configured, allowing all origins. \
             Set BERTH_CORS_ORIGINS in production."
        );
        base.allow_origin(AllowOrigin::any())
            .allow_credentials(false) // any() 不能与 credentials(true) 共用
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .into_iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        base.allow_origin(origins)
    }
}

/// Build the router with routes and middleware wired.
pub fn app_router(state: AppState, cors_origins: Vec<String>) -> Router {
    let container_routes = Router::new()
        .route("/containers", get(list_containers).post(create_container))
        .route(
            "/containers/:id",
            get(get_container).delete(delete_container),
        )
        .route("/containers/:id/start", post(start_container))
        .route("/containers/:id/attach", post(prepare_attach));

    // 流式端点：凭预检查签发的一次性令牌升级为 WebSocket
    let stream_routes = Router::new().route("/stream/attach/:token", get(stream_attach));

    Router::new()
        .route("/health", get(health))
        .merge(container_routes)
        .merge(stream_routes)
        .fallback(handler_404)
        .layer(build_cors_layer(cors_origins))
        .with_state(state)
}
