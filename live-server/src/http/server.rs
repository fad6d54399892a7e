use axum::Router;
use common::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ingest;
use crate::session::{AdmissionController, LivenessProber};
use crate::viewer::ViewerRegistry;

/// 一个HTTP监听端口及其路由
pub struct HttpServer {
    name: &'static str,
    addr: SocketAddr,
    app: Router,
}

impl HttpServer {
    /// 状态查询与观众WebSocket
    pub fn api(
        addr: SocketAddr,
        admission: Arc<AdmissionController>,
        registry: ViewerRegistry,
        prober: LivenessProber,
    ) -> Self {
        Self {
            name: "API",
            addr,
            app: super::routes::create_router(admission, registry, prober),
        }
    }

    /// HTTP-FLV推流接入
    pub fn ingest(addr: SocketAddr, admission: Arc<AdmissionController>) -> Self {
        Self {
            name: "Ingest",
            addr,
            app: ingest::router(admission),
        }
    }

    /// 运行到关闭令牌触发，然后等待在途请求结束
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("{} server listening on {}", self.name, listener.local_addr()?);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("{} server stopped", self.name);
        Ok(())
    }
}
