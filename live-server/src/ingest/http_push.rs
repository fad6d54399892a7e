use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use common::{LiveStreamError, MediaPacket, Result, TrackInfo};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use std::io;
use std::sync::Arc;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::PublishConnection;
use crate::flv::{FlvItem, FlvTagDecoder};
use crate::session::AdmissionController;

type BodyReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// HTTP-FLV推流连接
///
/// 请求体按FLV容器分帧，只拆出tag，不解析编码数据。
pub struct HttpFlvPublisher {
    path: String,
    frames: Option<FramedRead<BodyReader, FlvTagDecoder>>,
}

impl HttpFlvPublisher {
    /// 由任意字节流构建
    pub fn new<S>(path: impl Into<String>, body: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let reader = StreamReader::new(body.boxed());
        Self {
            path: path.into(),
            frames: Some(FramedRead::new(reader, FlvTagDecoder::new())),
        }
    }

    /// 由HTTP请求体构建
    pub fn from_body(path: impl Into<String>, body: Body) -> Self {
        let stream = body
            .into_data_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Self::new(path, stream)
    }

    async fn next_item(&mut self) -> Result<Option<FlvItem>> {
        match self.frames.as_mut() {
            Some(frames) => frames.next().await.transpose(),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PublishConnection for HttpFlvPublisher {
    fn path(&self) -> &str {
        &self.path
    }

    async fn read_tracks(&mut self) -> Result<TrackInfo> {
        match self.next_item().await? {
            Some(FlvItem::Header(tracks)) => Ok(tracks),
            Some(FlvItem::Packet(_)) => Err(LiveStreamError::Protocol(
                "media tag before FLV header".into(),
            )),
            None => Err(LiveStreamError::ConnectionFailure(
                "publisher closed before sending FLV header".into(),
            )),
        }
    }

    async fn read_packet(&mut self) -> Result<Option<MediaPacket>> {
        match self.next_item().await? {
            Some(FlvItem::Packet(packet)) => Ok(Some(packet)),
            Some(FlvItem::Header(_)) => Err(LiveStreamError::Protocol(
                "unexpected second FLV header".into(),
            )),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        if self.frames.take().is_some() {
            debug!("Closed publisher connection {}", self.path);
        }
    }
}

/// 推流端口的路由
pub fn router(admission: Arc<AdmissionController>) -> Router {
    Router::new()
        .route("/*path", post(publish))
        .with_state(admission)
        .layer(TraceLayer::new_for_http())
}

/// 接收一次推流，直到会话结束才返回
async fn publish(State(admission): State<Arc<AdmissionController>>, uri: Uri, body: Body) -> Response {
    let path = uri.path().to_string();
    info!("Publish attempt on {}", path);

    let conn = HttpFlvPublisher::from_body(path, body);

    // 会话放到独立任务里，推流端断开导致的请求取消不会跳过拆除流程
    let session = tokio::spawn(async move { admission.handle_publish(conn).await });

    match session.await {
        Ok(Ok(summary)) => (StatusCode::OK, Json(summary)).into_response(),
        Ok(Err(e)) => {
            let status = match &e {
                LiveStreamError::InvalidCredential(_) => StatusCode::FORBIDDEN,
                LiveStreamError::AdmissionConflict => StatusCode::CONFLICT,
                LiveStreamError::Protocol(_) => StatusCode::BAD_REQUEST,
                LiveStreamError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            if status.is_server_error() {
                error!("Publish session failed: {}", e);
            } else {
                warn!("Publish rejected: {}", e);
            }
            (status, e.to_string()).into_response()
        }
        Err(e) => {
            error!("Publish session task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flv::{encode_header, encode_tag};
    use bytes::BytesMut;
    use common::PacketKind;

    fn flv_bytes() -> Bytes {
        let mut buf = BytesMut::new();
        encode_header(
            &TrackInfo {
                has_audio: false,
                has_video: true,
            },
            &mut buf,
        );
        encode_tag(PacketKind::Video, 0, &[0x17, 0], &mut buf);
        encode_tag(PacketKind::Video, 33, &[0x27, 1], &mut buf);
        buf.freeze()
    }

    fn chunked(bytes: Bytes, size: usize) -> Vec<io::Result<Bytes>> {
        bytes
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect()
    }

    #[tokio::test]
    async fn test_reads_tracks_then_packets() {
        let body = futures::stream::iter(chunked(flv_bytes(), 5));
        let mut conn = HttpFlvPublisher::new("/live/secret42", body);

        assert_eq!(conn.path(), "/live/secret42");
        let tracks = conn.read_tracks().await.unwrap();
        assert!(!tracks.has_audio);
        assert!(tracks.has_video);

        let first = conn.read_packet().await.unwrap().unwrap();
        assert_eq!(first.timestamp, 0);
        let second = conn.read_packet().await.unwrap().unwrap();
        assert_eq!(second.timestamp, 33);
        assert_eq!(&second.data[..], &[0x27, 1]);

        assert!(conn.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_body_is_connection_failure() {
        let body = futures::stream::iter(Vec::<io::Result<Bytes>>::new());
        let mut conn = HttpFlvPublisher::new("/live/secret42", body);

        assert!(matches!(
            conn.read_tracks().await,
            Err(LiveStreamError::ConnectionFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let mut chunks = chunked(flv_bytes(), 64);
        chunks.truncate(1);
        chunks.push(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        let mut conn = HttpFlvPublisher::new("/live/secret42", futures::stream::iter(chunks));

        conn.read_tracks().await.unwrap();
        let mut result = conn.read_packet().await;
        while let Ok(Some(_)) = result {
            result = conn.read_packet().await;
        }
        assert!(matches!(result, Err(LiveStreamError::Io(_))));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let body = futures::stream::iter(chunked(flv_bytes(), 64));
        let mut conn = HttpFlvPublisher::new("/live/secret42", body);

        conn.close().await;
        conn.close().await;
        assert!(conn.read_packet().await.unwrap().is_none());
    }

    mod routing {
        use super::*;
        use crate::transcode::{FfmpegTranscoder, HlsPolicy};
        use axum::body::to_bytes;
        use axum::http::Request;
        use common::{SessionEnd, SessionSummary};
        use tower::ServiceExt;

        fn admission(dir: &std::path::Path) -> Arc<AdmissionController> {
            // true立即退出，不产生HLS输出
            let transcoder = Arc::new(FfmpegTranscoder::new("true", dir, HlsPolicy::default()));
            Arc::new(AdmissionController::new("secret42", dir, transcoder))
        }

        fn post(uri: &str, body: Bytes) -> Request<Body> {
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::from(body))
                .unwrap()
        }

        #[tokio::test]
        async fn test_wrong_key_is_forbidden() {
            let dir = tempfile::tempdir().unwrap();
            let response = router(admission(dir.path()))
                .oneshot(post("/live/wrongkey", flv_bytes()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }

        #[tokio::test]
        async fn test_second_publisher_conflicts() {
            let dir = tempfile::tempdir().unwrap();
            let admission = admission(dir.path());
            let _permit = admission.try_admit("/live/secret42").unwrap();

            let response = router(admission.clone())
                .oneshot(post("/live/secret42", flv_bytes()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CONFLICT);
            assert!(admission.is_live());
        }

        #[tokio::test]
        async fn test_complete_publish_returns_summary() {
            let dir = tempfile::tempdir().unwrap();
            let admission = admission(dir.path());

            let response = router(admission.clone())
                .oneshot(post("/live/secret42", flv_bytes()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let summary: SessionSummary = serde_json::from_slice(&body).unwrap();
            assert_eq!(summary.end_reason, SessionEnd::Eof);
            assert_eq!(summary.packets_written, 2);
            assert!(std::path::Path::new(&summary.recording_path).exists());
            assert!(!admission.is_live());
        }

        #[tokio::test]
        async fn test_force_stop_before_header_arrives() {
            let dir = tempfile::tempdir().unwrap();
            let admission = admission(dir.path());

            let silent = futures::stream::pending::<io::Result<Bytes>>();
            let session = tokio::spawn({
                let admission = admission.clone();
                async move {
                    admission
                        .handle_publish(HttpFlvPublisher::new("/live/secret42", silent))
                        .await
                }
            });
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            assert!(admission.is_live());

            assert!(admission.force_stop());
            let summary = tokio::time::timeout(std::time::Duration::from_secs(3), session)
                .await
                .expect("session kept waiting for the FLV header")
                .unwrap()
                .unwrap();
            assert_eq!(summary.end_reason, SessionEnd::ForcedStop);
            assert_eq!(summary.packets_written, 0);
            assert!(!admission.is_live());
            assert!(admission.current_stream_info().is_none());
        }

        #[tokio::test]
        async fn test_silent_publisher_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let transcoder = Arc::new(FfmpegTranscoder::new("true", dir.path(), HlsPolicy::default()));
            let admission = Arc::new(
                AdmissionController::new("secret42", dir.path(), transcoder)
                    .with_header_timeout(std::time::Duration::from_millis(100)),
            );

            let silent = futures::stream::pending::<io::Result<Bytes>>();
            let request = Request::builder()
                .method("POST")
                .uri("/live/secret42")
                .body(Body::from_stream(silent))
                .unwrap();

            let response = router(admission.clone()).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
            assert!(!admission.is_live());
        }
    }
}
