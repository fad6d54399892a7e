use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::session::{AdmissionController, LivenessProber};
use crate::viewer::ViewerRegistry;

pub fn create_router(
    admission: Arc<AdmissionController>,
    registry: ViewerRegistry,
    prober: LivenessProber,
) -> Router {
    Router::new()
        // 直播状态
        .route("/api/v1/stream/status", get(super::handlers::stream_status))
        // 观众在线通道
        .route("/api/v1/ws/viewer", get(super::handlers::viewer_ws))
        // 健康检查
        .route("/health", get(super::handlers::health_check))
        .with_state((admission, registry, prober))
        .layer(TraceLayer::new_for_http())
        // 播放页面与API不同源
        .layer(CorsLayer::permissive())
}
