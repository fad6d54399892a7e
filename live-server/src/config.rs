use anyhow::{bail, Context, Result};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub ingest_host: String,
    pub ingest_port: u16,
    pub stream_key: String,
    pub output_dir: PathBuf,
    pub ffmpeg_bin: String,
    /// HLS清单探测地址，未配置时仅以推流状态判断是否直播
    pub manifest_probe_url: Option<String>,
    pub log_level: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意键值来源加载配置（便于测试）
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let port = |keys: &[&str], default: u16| -> Result<u16> {
            match keys.iter().find_map(|k| get(k).map(|v| (*k, v))) {
                Some((key, value)) => value
                    .parse()
                    .with_context(|| format!("{} must be a port number, got {:?}", key, value)),
                None => Ok(default),
            }
        };

        let stream_key = get("STREAM_KEY")
            .or_else(|| get("RTMP_STREAM_KEY"))
            .unwrap_or_else(|| "djevent2024".to_string());
        if stream_key.contains('/') {
            bail!("STREAM_KEY must not contain '/'");
        }

        Ok(Self {
            server_host: get_or("SERVER_HOST", "0.0.0.0"),
            server_port: port(&["SERVER_PORT"], 8080)?,
            ingest_host: get_or("INGEST_HOST", "0.0.0.0"),
            ingest_port: port(&["INGEST_PORT", "RTMP_PORT"], 1935)?,
            stream_key,
            output_dir: PathBuf::from(get_or("HLS_OUTPUT_DIR", "./media")),
            ffmpeg_bin: get_or("FFMPEG_BIN", "ffmpeg"),
            manifest_probe_url: get("MANIFEST_PROBE_URL"),
            log_level: get_or("LOG_LEVEL", "info"),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn ingest_addr(&self) -> String {
        format!("{}:{}", self.ingest_host, self.ingest_port)
    }
}
