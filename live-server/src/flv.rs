// FLV容器封装
//
// 录制文件和HTTP-FLV推流都使用FLV容器。这里只处理容器层的分帧，
// 不解析音视频编码数据。
//
// ```text
// Header:  "FLV" | Version(1) | Flags(1) | HeaderSize(4) | PreviousTagSize0(4)
// Tag:     Type(1) | DataSize(3) | TS(3+1) | StreamID(3) | Data(N) | PreviousTagSize(4)
// ```

use bytes::{Buf, BufMut, BytesMut};
use common::{LiveStreamError, MediaPacket, PacketKind, TrackInfo};
use tokio_util::codec::Decoder;

const FLV_SIGNATURE: [u8; 3] = *b"FLV";
const FLV_VERSION: u8 = 0x01;
const FLV_HEADER_SIZE: u32 = 9;
const FLV_TAG_HEADER_SIZE: usize = 11;

const FLAG_AUDIO: u8 = 0x04;
const FLAG_VIDEO: u8 = 0x01;

const TAG_AUDIO: u8 = 8;
const TAG_VIDEO: u8 = 9;
const TAG_SCRIPT: u8 = 18;

/// DataSize字段只有24位
pub const MAX_TAG_DATA_SIZE: usize = 0x00FF_FFFF;

/// 文件头加PreviousTagSize0的总长度
pub const FILE_HEADER_LEN: usize = FLV_HEADER_SIZE as usize + 4;

/// 写入FLV文件头
pub fn encode_header(tracks: &TrackInfo, dst: &mut BytesMut) {
    let mut flags = 0u8;
    if tracks.has_audio {
        flags |= FLAG_AUDIO;
    }
    if tracks.has_video {
        flags |= FLAG_VIDEO;
    }

    dst.reserve(FILE_HEADER_LEN);
    dst.put_slice(&FLV_SIGNATURE);
    dst.put_u8(FLV_VERSION);
    dst.put_u8(flags);
    dst.put_u32(FLV_HEADER_SIZE);
    dst.put_u32(0);
}

/// 写入一个FLV tag（含尾部的PreviousTagSize）
///
/// 调用方保证 `data` 不超过 `MAX_TAG_DATA_SIZE`。
pub fn encode_tag(kind: PacketKind, timestamp: u32, data: &[u8], dst: &mut BytesMut) {
    let tag_type = match kind {
        PacketKind::Audio => TAG_AUDIO,
        PacketKind::Video => TAG_VIDEO,
        PacketKind::Script => TAG_SCRIPT,
    };
    let data_size = data.len() as u32;

    dst.reserve(FLV_TAG_HEADER_SIZE + data.len() + 4);
    dst.put_u8(tag_type);
    dst.put_uint(data_size as u64, 3);
    // 低24位 + 扩展字节
    dst.put_uint((timestamp & 0x00FF_FFFF) as u64, 3);
    dst.put_u8((timestamp >> 24) as u8);
    dst.put_uint(0, 3);
    dst.put_slice(data);
    dst.put_u32(FLV_TAG_HEADER_SIZE as u32 + data_size);
}

/// 解码结果
#[derive(Debug, Clone)]
pub enum FlvItem {
    Header(TrackInfo),
    Packet(MediaPacket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Tags,
}

/// FLV字节流分帧器
///
/// 先产出一次 `FlvItem::Header`，随后按到达顺序产出媒体包。
/// 未知类型的tag会被跳过。
#[derive(Debug)]
pub struct FlvTagDecoder {
    state: DecodeState,
}

impl FlvTagDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }
}

impl Default for FlvTagDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FlvTagDecoder {
    type Item = FlvItem;
    type Error = LiveStreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FlvItem>, LiveStreamError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < FLV_HEADER_SIZE as usize {
                        return Ok(None);
                    }
                    if src[..3] != FLV_SIGNATURE {
                        return Err(LiveStreamError::Protocol("missing FLV signature".into()));
                    }
                    let flags = src[4];
                    let header_size = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
                    if header_size < FLV_HEADER_SIZE as usize {
                        return Err(LiveStreamError::Protocol(format!(
                            "invalid FLV header size {}",
                            header_size
                        )));
                    }
                    if src.len() < header_size + 4 {
                        src.reserve(header_size + 4 - src.len());
                        return Ok(None);
                    }
                    src.advance(header_size + 4);
                    self.state = DecodeState::Tags;

                    return Ok(Some(FlvItem::Header(TrackInfo {
                        has_audio: flags & FLAG_AUDIO != 0,
                        has_video: flags & FLAG_VIDEO != 0,
                    })));
                }
                DecodeState::Tags => {
                    if src.len() < FLV_TAG_HEADER_SIZE {
                        return Ok(None);
                    }
                    let tag_type = src[0] & 0x1F;
                    let data_size =
                        ((src[1] as usize) << 16) | ((src[2] as usize) << 8) | src[3] as usize;
                    let timestamp = ((src[7] as u32) << 24)
                        | ((src[4] as u32) << 16)
                        | ((src[5] as u32) << 8)
                        | src[6] as u32;

                    let total = FLV_TAG_HEADER_SIZE + data_size + 4;
                    if src.len() < total {
                        src.reserve(total - src.len());
                        return Ok(None);
                    }

                    src.advance(FLV_TAG_HEADER_SIZE);
                    let data = src.split_to(data_size).freeze();
                    src.advance(4);

                    let kind = match tag_type {
                        TAG_AUDIO => PacketKind::Audio,
                        TAG_VIDEO => PacketKind::Video,
                        TAG_SCRIPT => PacketKind::Script,
                        _ => continue,
                    };

                    return Ok(Some(FlvItem::Packet(MediaPacket {
                        kind,
                        timestamp,
                        data,
                    })));
                }
            }
        }
    }
}
