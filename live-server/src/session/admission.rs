use chrono::{DateTime, Utc};
use common::{
    LiveStreamError, Result, SessionEnd, SessionSummary, StreamInfo, StreamState,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ingest::PublishConnection;
use crate::recording::RecordingSink;
use crate::transcode::{TranscodeJob, Transcoder};

/// 推流端连上后等待轨道信息的最长时间
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// 准入槽位中保存的会话信息
#[derive(Debug, Clone)]
struct ActiveSession {
    session_id: Uuid,
    stream_key: String,
    started_at: DateTime<Utc>,
    state: StreamState,
    cancel: CancellationToken,
}

impl ActiveSession {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            session_id: self.session_id,
            stream_key: self.stream_key.clone(),
            started_at: self.started_at,
            state: self.state,
        }
    }
}

type Slot = Arc<Mutex<Option<ActiveSession>>>;

/// 推流准入许可
///
/// 持有期间槽位被占用；被丢弃时释放槽位，
/// 会话任务异常退出也不会把槽位永久占住。
pub struct AdmissionPermit {
    slot: Slot,
    session: ActiveSession,
}

impl AdmissionPermit {
    pub fn session_id(&self) -> Uuid {
        self.session.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.session.started_at
    }

    fn cancellation_token(&self) -> &CancellationToken {
        &self.session.cancel
    }

    fn set_state(&self, state: StreamState) {
        let mut slot = self.slot.lock();
        if let Some(active) = slot.as_mut() {
            if active.session_id == self.session.session_id {
                active.state = state;
            }
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        let owned = slot
            .as_ref()
            .map(|active| active.session_id == self.session.session_id)
            .unwrap_or(false);
        if owned {
            *slot = None;
            info!("Stream slot released (session {})", self.session.session_id);
        }
    }
}

/// 转码任务启动后会话持有的资源
///
/// 正常拆除时先停止转码再释放槽位。会话future被中途丢弃时，
/// 槽位交给后台任务，等转码进程真正退出后才释放。
struct SessionResources {
    permit: Option<AdmissionPermit>,
    job: Option<TranscodeJob>,
}

impl SessionResources {
    fn set_state(&self, state: StreamState) {
        if let Some(permit) = self.permit.as_ref() {
            permit.set_state(state);
        }
    }

    async fn stop_job(&mut self) {
        if let Some(job) = self.job.as_mut() {
            job.stop().await;
        }
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let supervisor = self.job.as_mut().and_then(TranscodeJob::detach);
        let (Some(supervisor), Ok(runtime)) = (supervisor, tokio::runtime::Handle::try_current())
        else {
            return;
        };

        permit.set_state(StreamState::Stopping);
        warn!(
            "Session {} dropped, holding the slot until the transcoder exits",
            permit.session_id()
        );
        runtime.spawn(async move {
            let _ = supervisor.await;
            drop(permit);
        });
    }
}

/// 推流准入控制
///
/// 系统内同时只允许一个推流会话。准入检查和占位在同一个临界区内完成，
/// 锁只保护槽位交换，从不跨越I/O。
pub struct AdmissionController {
    stream_key: String,
    output_dir: PathBuf,
    transcoder: Arc<dyn Transcoder>,
    header_timeout: Duration,
    slot: Slot,
}

impl AdmissionController {
    pub fn new(
        stream_key: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            output_dir: output_dir.into(),
            transcoder,
            header_timeout: HEADER_TIMEOUT,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// 覆盖等待推流头部的时限
    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    /// 校验推流路径并占用槽位
    pub fn try_admit(&self, path: &str) -> Result<AdmissionPermit> {
        let credential_ok = path
            .strip_prefix("/live/")
            .map(|key| key == self.stream_key)
            .unwrap_or(false);
        if !credential_ok {
            warn!("Rejected publish on {}: invalid stream key", path);
            return Err(LiveStreamError::InvalidCredential(path.to_string()));
        }

        let mut slot = self.slot.lock();
        if let Some(active) = slot.as_ref() {
            warn!(
                "Rejected publish on {}: session {} is {:?}",
                path, active.session_id, active.state
            );
            return Err(LiveStreamError::AdmissionConflict);
        }

        let session = ActiveSession {
            session_id: Uuid::new_v4(),
            stream_key: self.stream_key.clone(),
            started_at: Utc::now(),
            state: StreamState::Publishing,
            cancel: CancellationToken::new(),
        };
        *slot = Some(session.clone());
        drop(slot);

        info!("Stream admitted (session {})", session.session_id);
        Ok(AdmissionPermit {
            slot: self.slot.clone(),
            session,
        })
    }

    /// 处理一次推流：准入失败时关闭连接，成功则运行完整会话
    pub async fn handle_publish<C: PublishConnection>(&self, mut conn: C) -> Result<SessionSummary> {
        let permit = match self.try_admit(conn.path()) {
            Ok(permit) => permit,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };

        self.run_session(permit, conn).await
    }

    /// 会话生命周期：录制、转码、拷贝媒体包、拆除
    ///
    /// 每条退出路径都会停止转码任务、关闭连接并释放槽位。
    /// 录制写入失败以 `LiveStreamError::Io` 返回，推流端迟迟不发送头部时返回
    /// `LiveStreamError::Timeout`，其余结束方式返回会话摘要。
    pub async fn run_session<C: PublishConnection>(
        &self,
        permit: AdmissionPermit,
        mut conn: C,
    ) -> Result<SessionSummary> {
        let session_id = permit.session_id();
        let started_at = permit.started_at();
        let cancel = permit.cancellation_token().clone();

        // 等待头部期间同样响应强制停止
        let header = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.start_recording(&permit, &mut conn) => Some(result),
        };
        let mut sink = match header {
            Some(Ok(sink)) => sink,
            Some(Err(e)) => {
                error!("Session {} failed before recording started: {}", session_id, e);
                permit.set_state(StreamState::Stopping);
                conn.close().await;
                return Err(e);
            }
            None => {
                info!("Session {} stopped before the stream header arrived", session_id);
                permit.set_state(StreamState::Stopping);
                conn.close().await;
                let path = self.output_dir.join(RecordingSink::file_name_for(started_at));
                return Ok(SessionSummary {
                    session_id,
                    recording_path: path.to_string_lossy().into_owned(),
                    packets_written: 0,
                    bytes_written: 0,
                    started_at,
                    ended_at: Utc::now(),
                    end_reason: SessionEnd::ForcedStop,
                });
            }
        };

        // 转码启动失败不影响录制
        let job = match self.transcoder.start_job(sink.path(), started_at).await {
            Ok(job) => Some(job),
            Err(e) => {
                error!("Failed to start transcoder for session {}: {}", session_id, e);
                None
            }
        };
        let mut resources = SessionResources {
            permit: Some(permit),
            job,
        };

        let mut write_error = None;
        let end_reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::ForcedStop,
                packet = conn.read_packet() => match packet {
                    Ok(Some(packet)) => {
                        if let Err(e) = sink.write_packet(&packet).await {
                            error!("Recording write failed for session {}: {}", session_id, e);
                            write_error = Some(e);
                            break SessionEnd::WriteFailure;
                        }
                    }
                    Ok(None) => break SessionEnd::Eof,
                    Err(e) => {
                        warn!("Publisher connection error in session {}: {}", session_id, e);
                        break SessionEnd::TransportError;
                    }
                },
            }
        };

        info!("Session {} ending: {:?}", session_id, end_reason);
        resources.set_state(StreamState::Stopping);

        if write_error.is_none() {
            if let Err(e) = sink.write_trailer().await {
                error!("Failed to finalize recording {:?}: {}", sink.path(), e);
            }
        }
        resources.stop_job().await;
        conn.close().await;

        let summary = SessionSummary {
            session_id,
            recording_path: sink.path().to_string_lossy().into_owned(),
            packets_written: sink.packets_written(),
            bytes_written: sink.bytes_written(),
            started_at,
            ended_at: Utc::now(),
            end_reason,
        };
        drop(resources);

        match write_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn start_recording<C: PublishConnection>(
        &self,
        permit: &AdmissionPermit,
        conn: &mut C,
    ) -> Result<RecordingSink> {
        let mut sink = RecordingSink::create(&self.output_dir, permit.started_at()).await?;
        let tracks = tokio::time::timeout(self.header_timeout, conn.read_tracks())
            .await
            .map_err(|_| LiveStreamError::Timeout(self.header_timeout))??;
        sink.write_header(&tracks).await?;
        Ok(sink)
    }

    /// 强制断开当前会话，返回调用时是否有会话在进行
    pub fn force_stop(&self) -> bool {
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some(active) => {
                if !active.cancel.is_cancelled() {
                    info!("Force stopping session {}", active.session_id);
                    active.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.slot
            .lock()
            .as_ref()
            .map(|active| active.state)
            .unwrap_or(StreamState::Idle)
    }

    pub fn is_live(&self) -> bool {
        self.state() == StreamState::Publishing
    }

    pub fn current_stream_info(&self) -> Option<StreamInfo> {
        self.slot.lock().as_ref().map(ActiveSession::info)
    }
}
