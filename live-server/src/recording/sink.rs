use bytes::BytesMut;
use chrono::{DateTime, Utc};
use common::{LiveStreamError, MediaPacket, Result, TrackInfo};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::flv;

/// 录制输出
///
/// 把一个推流会话的媒体包按到达顺序写入FLV文件。文件头只写一次，
/// 且必须先于第一个媒体包；任何写入失败都直接返回给调用方，不做缓冲或重试。
pub struct RecordingSink {
    path: PathBuf,
    file: File,
    buf: BytesMut,
    header_written: bool,
    first_timestamp: Option<u32>,
    packets_written: u64,
    bytes_written: u64,
}

impl RecordingSink {
    /// 由会话开始时间（秒级）生成文件名
    pub fn file_name_for(started_at: DateTime<Utc>) -> String {
        format!("stream_{}.flv", started_at.format("%Y%m%d_%H%M%S"))
    }

    /// 在输出目录中创建录制文件
    pub async fn create(output_dir: &Path, started_at: DateTime<Utc>) -> Result<Self> {
        tokio::fs::create_dir_all(output_dir).await?;

        let path = output_dir.join(Self::file_name_for(started_at));
        let file = File::create(&path).await?;
        info!("Recording to {:?}", path);

        Ok(Self {
            path,
            file,
            buf: BytesMut::with_capacity(64 * 1024),
            header_written: false,
            first_timestamp: None,
            packets_written: 0,
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// 写入容器头
    pub async fn write_header(&mut self, tracks: &TrackInfo) -> Result<()> {
        if self.header_written {
            return Err(LiveStreamError::Protocol("FLV header already written".into()));
        }

        self.buf.clear();
        flv::encode_header(tracks, &mut self.buf);
        self.flush_buf().await?;
        self.header_written = true;

        debug!(
            "Wrote FLV header (audio: {}, video: {})",
            tracks.has_audio, tracks.has_video
        );
        Ok(())
    }

    /// 写入一个媒体包，时间戳以第一个包为零点
    ///
    /// FLV时间戳按有符号32位解释，早于第一个包的时间戳保存为负偏移，
    /// 音视频交错到达时相对顺序不变。
    pub async fn write_packet(&mut self, packet: &MediaPacket) -> Result<()> {
        if !self.header_written {
            return Err(LiveStreamError::Protocol(
                "packet received before FLV header".into(),
            ));
        }
        if packet.data.len() > flv::MAX_TAG_DATA_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "packet of {} bytes exceeds the FLV tag size limit",
                    packet.data.len()
                ),
            )
            .into());
        }

        let base = *self.first_timestamp.get_or_insert(packet.timestamp);
        let timestamp = packet.timestamp.wrapping_sub(base);

        self.buf.clear();
        flv::encode_tag(packet.kind, timestamp, &packet.data, &mut self.buf);
        self.flush_buf().await?;
        self.packets_written += 1;
        Ok(())
    }

    /// 正常结束时落盘
    pub async fn write_trailer(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        info!(
            "Recording finished: {:?} ({} packets, {} bytes)",
            self.path, self.packets_written, self.bytes_written
        );
        Ok(())
    }

    // 转码进程实时读取该文件，每次写入后立即flush
    async fn flush_buf(&mut self) -> Result<()> {
        self.file.write_all(&self.buf).await?;
        self.file.flush().await?;
        self.bytes_written += self.buf.len() as u64;
        Ok(())
    }
}
