use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 媒体包类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Audio,
    Video,
    /// 脚本数据（onMetaData等）
    Script,
}

/// 推流端交付的带时间戳的不透明媒体包
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: PacketKind,
    /// 时间戳（毫秒）
    pub timestamp: u32,
    pub data: Bytes,
}

impl MediaPacket {
    pub fn new(kind: PacketKind, timestamp: u32, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            timestamp,
            data: data.into(),
        }
    }
}

/// 推流端声明的轨道信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub has_audio: bool,
    pub has_video: bool,
}

impl Default for TrackInfo {
    fn default() -> Self {
        Self {
            has_audio: true,
            has_video: true,
        }
    }
}

/// 推流会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Publishing,
    Stopping,
}

/// 当前推流信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub session_id: Uuid,
    pub stream_key: String,
    pub started_at: DateTime<Utc>,
    pub state: StreamState,
}

/// 会话结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// 推流端正常结束（EOF）
    Eof,
    /// 推流连接出错
    TransportError,
    /// 录制写入失败
    WriteFailure,
    /// 被服务端强制断开
    ForcedStop,
}

/// 会话结束摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub recording_path: String,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: SessionEnd,
}
