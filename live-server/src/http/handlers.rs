use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    Json,
};
use common::StreamStatusResponse;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::session::{AdmissionController, LivenessProber};
use crate::viewer::{serve_viewer, ViewerRegistry};

type AppState = (Arc<AdmissionController>, ViewerRegistry, LivenessProber);

#[derive(Serialize)]
pub struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }
}

/// 健康检查
pub async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::success("OK".to_string()))
}

/// 当前直播状态和在线人数
pub async fn stream_status(
    State((admission, registry, prober)): State<AppState>,
) -> Json<StreamStatusResponse> {
    let is_live = prober.is_live().await;
    let info = admission.current_stream_info();

    Json(StreamStatusResponse {
        is_live,
        viewer_count: registry.viewer_count(),
        stream_key: info.as_ref().map(|i| i.stream_key.clone()),
        started_at: info.map(|i| i.started_at),
    })
}

/// 观众WebSocket升级
pub async fn viewer_ws(
    ws: WebSocketUpgrade,
    State((_, registry, _)): State<AppState>,
) -> Response {
    debug!("Viewer WebSocket upgrade");
    ws.on_upgrade(move |socket| serve_viewer(socket, registry))
}
