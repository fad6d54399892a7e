// 转码编排
//
// 外部分片进程（ffmpeg）读取录制中的FLV文件，输出滚动的HLS清单和分片。
// 每个推流会话最多一个转码任务，异常退出只记录日志，不在会话内重启。

mod ffmpeg;
mod job;
mod retention;

pub use ffmpeg::FfmpegTranscoder;
pub use job::{JobExit, TranscodeJob};
pub use retention::{spawn_retention_sweep, SEGMENT_MAX_AGE, SWEEP_INTERVAL};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Result;
use std::path::{Path, PathBuf};

/// HLS输出目录名
pub const HLS_DIR: &str = "hls";
/// 清单文件名
pub const PLAYLIST_NAME: &str = "stream.m3u8";

/// 固定的HLS输出策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsPolicy {
    /// 分片时长（秒）
    pub segment_duration: u32,
    /// 清单中保留的分片数
    pub playlist_size: u32,
    /// 输出高度上限
    pub max_height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    /// 关键帧间隔（帧）
    pub gop_size: u32,
}

impl Default for HlsPolicy {
    fn default() -> Self {
        Self {
            segment_duration: 2,
            playlist_size: 10,
            max_height: 720,
            video_bitrate_kbps: 3000,
            audio_bitrate_kbps: 128,
            gop_size: 48,
        }
    }
}

/// 转码器抽象，便于替换外部进程
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// 针对录制文件启动转码任务，立即返回
    async fn start_job(&self, input_path: &Path, started_at: DateTime<Utc>) -> Result<TranscodeJob>;

    /// HLS输出目录
    fn hls_dir(&self) -> PathBuf;

    fn playlist_path(&self) -> PathBuf {
        self.hls_dir().join(PLAYLIST_NAME)
    }
}
