use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Result;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

use super::{HlsPolicy, TranscodeJob, Transcoder, HLS_DIR, PLAYLIST_NAME};

/// 基于ffmpeg命令行的HLS转码器
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
    output_dir: PathBuf,
    policy: HlsPolicy,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<String>, output_dir: impl Into<PathBuf>, policy: HlsPolicy) -> Self {
        Self {
            program: program.into(),
            output_dir: output_dir.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &HlsPolicy {
        &self.policy
    }

    /// 构建ffmpeg参数
    pub fn build_args(&self, input_path: &Path) -> Vec<String> {
        let policy = &self.policy;
        let hls_dir = self.hls_dir();
        let gop = policy.gop_size.to_string();

        vec![
            // 按原始速率读取录制中的文件
            "-re".into(),
            "-i".into(),
            input_path.to_string_lossy().into_owned(),
            // 单一码率档位
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:v".into(),
            format!("{}k", policy.video_bitrate_kbps),
            "-b:a".into(),
            format!("{}k", policy.audio_bitrate_kbps),
            "-vf".into(),
            format!("scale=-2:'min({},ih)'", policy.max_height),
            "-g".into(),
            gop.clone(),
            "-keyint_min".into(),
            gop,
            "-sc_threshold".into(),
            "0".into(),
            // 滚动窗口，过期分片由ffmpeg自行删除
            "-hls_time".into(),
            policy.segment_duration.to_string(),
            "-hls_list_size".into(),
            policy.playlist_size.to_string(),
            "-hls_flags".into(),
            "delete_segments+append_list".into(),
            "-hls_segment_filename".into(),
            hls_dir.join("segment_%03d.ts").to_string_lossy().into_owned(),
            "-f".into(),
            "hls".into(),
            hls_dir.join(PLAYLIST_NAME).to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start_job(&self, input_path: &Path, started_at: DateTime<Utc>) -> Result<TranscodeJob> {
        let hls_dir = self.hls_dir();
        tokio::fs::create_dir_all(&hls_dir).await?;

        let args = self.build_args(input_path);
        info!(
            "Starting HLS conversion for session started at {}: {} {}",
            started_at.to_rfc3339(),
            self.program,
            args.join(" ")
        );

        let mut command = Command::new(&self.program);
        command.args(&args);

        TranscodeJob::spawn(command, input_path, &hls_dir, &self.policy)
    }

    fn hls_dir(&self) -> PathBuf {
        self.output_dir.join(HLS_DIR)
    }
}
