mod config;
mod flv;
mod http;
mod ingest;
mod recording;
mod session;
mod transcode;
mod viewer;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::http::HttpServer;
use crate::session::{AdmissionController, LivenessProber, ManifestProbe};
use crate::transcode::{FfmpegTranscoder, HlsPolicy, Transcoder, SEGMENT_MAX_AGE, SWEEP_INTERVAL};
use crate::viewer::ViewerRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = config::Config::load()?;

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("🚀 Live server starting...");
    info!("✓ Configuration loaded (output: {:?})", config.output_dir);

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("cannot create output directory {:?}", config.output_dir))?;

    // 会话编排
    let transcoder = Arc::new(FfmpegTranscoder::new(
        config.ffmpeg_bin.clone(),
        config.output_dir.clone(),
        HlsPolicy::default(),
    ));
    let hls_dir = transcoder.hls_dir();
    let admission = Arc::new(AdmissionController::new(
        config.stream_key.clone(),
        config.output_dir.clone(),
        transcoder,
    ));

    let probe = config.manifest_probe_url.clone().map(ManifestProbe::new);
    if let Some(probe) = &probe {
        info!("✓ Manifest probe enabled: {}", probe.url());
    }
    let prober = LivenessProber::new(admission.clone(), probe);

    // 观众注册表
    let (registry, registry_task) = ViewerRegistry::spawn();
    info!("✓ Viewer registry started");

    // 过期分片清理
    let shutdown = CancellationToken::new();
    let retention = transcode::spawn_retention_sweep(
        hls_dir,
        SWEEP_INTERVAL,
        SEGMENT_MAX_AGE,
        shutdown.child_token(),
    );

    let api_server = HttpServer::api(
        config.server_addr().parse().context("invalid SERVER_HOST/SERVER_PORT")?,
        admission.clone(),
        registry,
        prober,
    );
    let ingest_server = HttpServer::ingest(
        config.ingest_addr().parse().context("invalid INGEST_HOST/INGEST_PORT")?,
        admission.clone(),
    );

    info!("✅ Live server ready! Publish to http://{}/live/<key>", config.ingest_addr());

    let api_handle = spawn_server(api_server, shutdown.clone());
    let ingest_handle = spawn_server(ingest_server, shutdown.clone());

    tokio::spawn({
        let shutdown = shutdown.clone();
        let admission = admission.clone();
        async move {
            tokio::select! {
                _ = wait_for_signal() => info!("Shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
            // 先断开推流，会话拆除时会停止转码
            if admission.force_stop() {
                info!("Active stream session stopped");
            }
            shutdown.cancel();
        }
    });

    // 等待两个服务器
    let (api_result, ingest_result) = tokio::try_join!(api_handle, ingest_handle)?;
    for result in [api_result, ingest_result] {
        if let Err(e) = result {
            error!("Server error: {}", e);
        }
    }

    shutdown.cancel();
    if let Err(e) = retention.await {
        warn!("Retention task failed: {}", e);
    }
    // 仍在线的观众随注册表关闭收到Close帧
    registry_task.abort();

    info!("Live server stopped");
    Ok(())
}

fn spawn_server(server: HttpServer, shutdown: CancellationToken) -> JoinHandle<common::Result<()>> {
    tokio::spawn(async move {
        let result = server.run(shutdown.child_token()).await;
        // 任一端口退出都会关闭整个服务
        shutdown.cancel();
        result
    })
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
