use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LiveStreamError {
    /// 已有推流会话在进行
    #[error("A stream session is already active")]
    AdmissionConflict,

    /// 推流密钥不匹配
    #[error("Invalid stream credential: {0}")]
    InvalidCredential(String),

    /// 录制文件写入失败
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 转码进程异常
    #[error("Transcoder process failure: {0}")]
    ProcessFailure(String),

    /// 连接传输错误（观众端或推流端）
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// 容器封装格式错误
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LiveStreamError {
    /// 是否为准入阶段的拒绝（不影响当前会话）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LiveStreamError::AdmissionConflict | LiveStreamError::InvalidCredential(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LiveStreamError>;
