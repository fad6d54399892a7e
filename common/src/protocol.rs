use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const PONG_FRAME: &str = r#"{"type":"pong"}"#;

/// 观众通道消息（JSON文本帧）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerMessage {
    /// 在线人数更新
    ViewerCount { count: usize },
    /// 服务端心跳
    Ping,
    /// 客户端心跳应答
    Pong,
}

impl ViewerMessage {
    /// 编码为文本帧
    pub fn to_text(&self) -> String {
        // 仅包含基本类型字段，序列化不会失败
        serde_json::to_string(self).unwrap_or_default()
    }

    /// 是否为客户端的pong应答（按字面匹配）
    pub fn is_pong(text: &str) -> bool {
        text.trim() == PONG_FRAME
    }
}

/// 直播状态响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatusResponse {
    pub is_live: bool,
    pub viewer_count: usize,
    pub stream_key: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}
